//! Delivery ledger: durable store of events, endpoints and deliveries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use cityforge_events::{Event, EventType};

use crate::delivery::{Delivery, DeliveryStatus};
use crate::endpoint::Endpoint;
use crate::error::{WebhookError, WebhookResult};

/// Trait for ledger backends.
///
/// The ledger is the durable source of truth. The engine's retry queue is a
/// process-local cache of the non-terminal part of it.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    // ==================== Event Operations ====================

    /// Saves an event.
    async fn save_event(&self, event: &Event) -> WebhookResult<()>;

    /// Gets an event by ID.
    async fn get_event(&self, id: &str) -> WebhookResult<Option<Event>>;

    // ==================== Endpoint Operations ====================

    /// Inserts or replaces an endpoint.
    async fn save_endpoint(&self, endpoint: &Endpoint) -> WebhookResult<()>;

    /// Gets an endpoint by ID.
    async fn get_endpoint(&self, id: &str) -> WebhookResult<Option<Endpoint>>;

    /// Lists all endpoints.
    async fn list_endpoints(&self) -> WebhookResult<Vec<Endpoint>>;

    /// Deletes an endpoint. Returns whether it existed.
    async fn delete_endpoint(&self, id: &str) -> WebhookResult<bool>;

    /// Lists enabled endpoints subscribed to `event_type`.
    async fn find_subscribed_endpoints(&self, event_type: EventType) -> WebhookResult<Vec<Endpoint>>;

    // ==================== Delivery Operations ====================

    /// Inserts a new delivery.
    async fn insert_delivery(&self, delivery: &Delivery) -> WebhookResult<()>;

    /// Overwrites an existing delivery.
    async fn update_delivery(&self, delivery: &Delivery) -> WebhookResult<()>;

    /// Gets a delivery by ID.
    async fn get_delivery(&self, id: &str) -> WebhookResult<Option<Delivery>>;

    /// Lists deliveries of an event.
    async fn list_deliveries_for_event(&self, event_id: &str) -> WebhookResult<Vec<Delivery>>;

    /// Lists the most recent deliveries to an endpoint, newest first.
    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: &str,
        limit: usize,
    ) -> WebhookResult<Vec<Delivery>>;

    /// Lists pending deliveries whose retry time is at or before `now`.
    async fn list_due_deliveries(&self, now: DateTime<Utc>, limit: usize) -> WebhookResult<Vec<Delivery>>;

    /// Deletes terminal deliveries last updated before `older_than`, then
    /// events older than it that no delivery references. Returns the number
    /// of deliveries deleted.
    async fn cleanup_terminal_deliveries(&self, older_than: DateTime<Utc>) -> WebhookResult<usize>;
}

/// In-memory ledger for tests and single-process deployments.
pub struct InMemoryLedger {
    events: RwLock<HashMap<String, Event>>,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    deliveries: RwLock<HashMap<String, Delivery>>,
}

impl InMemoryLedger {
    /// Creates a new in-memory ledger.
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of stored events.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns the number of stored deliveries.
    pub async fn delivery_count(&self) -> usize {
        self.deliveries.read().await.len()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookLedger for InMemoryLedger {
    async fn save_event(&self, event: &Event) -> WebhookResult<()> {
        let mut events = self.events.write().await;
        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get_event(&self, id: &str) -> WebhookResult<Option<Event>> {
        let events = self.events.read().await;
        Ok(events.get(id).cloned())
    }

    async fn save_endpoint(&self, endpoint: &Endpoint) -> WebhookResult<()> {
        let mut endpoints = self.endpoints.write().await;
        endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(&self, id: &str) -> WebhookResult<Option<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        Ok(endpoints.get(id).cloned())
    }

    async fn list_endpoints(&self) -> WebhookResult<Vec<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        let mut list: Vec<Endpoint> = endpoints.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn delete_endpoint(&self, id: &str) -> WebhookResult<bool> {
        let mut endpoints = self.endpoints.write().await;
        Ok(endpoints.remove(id).is_some())
    }

    async fn find_subscribed_endpoints(&self, event_type: EventType) -> WebhookResult<Vec<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        Ok(endpoints
            .values()
            .filter(|e| e.should_receive(event_type))
            .cloned()
            .collect())
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> WebhookResult<()> {
        let mut deliveries = self.deliveries.write().await;
        if deliveries.contains_key(&delivery.id) {
            return Err(WebhookError::Storage(format!(
                "delivery {} already exists",
                delivery.id
            )));
        }
        deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &Delivery) -> WebhookResult<()> {
        let mut deliveries = self.deliveries.write().await;
        // Upsert: a failed insert during dispatch must not strand later updates.
        deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: &str) -> WebhookResult<Option<Delivery>> {
        let deliveries = self.deliveries.read().await;
        Ok(deliveries.get(id).cloned())
    }

    async fn list_deliveries_for_event(&self, event_id: &str) -> WebhookResult<Vec<Delivery>> {
        let deliveries = self.deliveries.read().await;
        Ok(deliveries
            .values()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: &str,
        limit: usize,
    ) -> WebhookResult<Vec<Delivery>> {
        let deliveries = self.deliveries.read().await;
        let mut list: Vec<Delivery> = deliveries
            .values()
            .filter(|d| d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit);
        Ok(list)
    }

    async fn list_due_deliveries(&self, now: DateTime<Utc>, limit: usize) -> WebhookResult<Vec<Delivery>> {
        let deliveries = self.deliveries.read().await;
        let mut due: Vec<Delivery> = deliveries.values().filter(|d| d.is_due(now)).cloned().collect();
        due.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn cleanup_terminal_deliveries(&self, older_than: DateTime<Utc>) -> WebhookResult<usize> {
        let mut deliveries = self.deliveries.write().await;
        let before_len = deliveries.len();
        deliveries.retain(|_, d| !(d.status.is_terminal() && d.updated_at < older_than));
        let removed = before_len - deliveries.len();

        let referenced: HashSet<&str> = deliveries.values().map(|d| d.event_id.as_str()).collect();
        let mut events = self.events.write().await;
        events.retain(|id, e| e.timestamp >= older_than || referenced.contains(id.as_str()));

        Ok(removed)
    }
}
