//! In-process retry queue.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use cityforge_events::Event;

use crate::delivery::{Delivery, DeliveryStatus};
use crate::endpoint::Endpoint;

/// A non-terminal delivery with everything needed to attempt it again.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub delivery: Delivery,
    /// Endpoint configuration the next attempt uses.
    pub endpoint: Endpoint,
    pub event: Arc<Event>,
    /// Canonical serialized event: the request body and the signed bytes.
    pub payload: Arc<str>,
    /// Set while an attempt owns the entry.
    in_flight: bool,
}

impl QueuedDelivery {
    /// Creates a queue entry.
    pub fn new(delivery: Delivery, endpoint: Endpoint, event: Arc<Event>, payload: Arc<str>) -> Self {
        Self {
            delivery,
            endpoint,
            event,
            payload,
            in_flight: false,
        }
    }
}

/// Deliveries awaiting an attempt, keyed by delivery id.
///
/// Entries leave the queue the moment their delivery becomes terminal. The
/// in-flight claim keeps the dispatch path and the retry sweep from
/// attempting the same delivery at once.
pub struct RetryQueue {
    entries: RwLock<HashMap<String, QueuedDelivery>>,
}

impl RetryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a shared queue.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Adds an entry, replacing any entry with the same delivery id.
    pub async fn insert(&self, entry: QueuedDelivery) {
        let mut entries = self.entries.write().await;
        entries.insert(entry.delivery.id.clone(), entry);
    }

    /// Claims a pending entry for an attempt.
    ///
    /// Returns `None` if the id is unknown, the entry is already claimed, or
    /// its delivery is not pending.
    pub async fn claim(&self, delivery_id: &str) -> Option<QueuedDelivery> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(delivery_id)?;
        if entry.in_flight || entry.delivery.status != DeliveryStatus::Pending {
            return None;
        }
        entry.in_flight = true;
        Some(entry.clone())
    }

    /// Stores the latest state of a claimed delivery without releasing it.
    pub async fn update(&self, delivery: &Delivery) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&delivery.id) {
            entry.delivery = delivery.clone();
        }
    }

    /// Stores the delivery's new state and releases the claim.
    pub async fn release(&self, delivery: Delivery) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&delivery.id) {
            entry.delivery = delivery;
            entry.in_flight = false;
        }
    }

    /// Replaces the endpoint snapshot of an unclaimed entry.
    pub async fn refresh_endpoint(&self, delivery_id: &str, endpoint: Endpoint) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(delivery_id) {
            if !entry.in_flight {
                entry.endpoint = endpoint;
            }
        }
    }

    /// Removes an entry.
    pub async fn remove(&self, delivery_id: &str) -> Option<QueuedDelivery> {
        let mut entries = self.entries.write().await;
        entries.remove(delivery_id)
    }

    /// Unclaimed pending entries whose retry time has come.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<QueuedDelivery> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| !e.in_flight && e.delivery.is_due(now))
            .cloned()
            .collect()
    }

    /// Checks whether a delivery is queued.
    pub async fn contains(&self, delivery_id: &str) -> bool {
        self.entries.read().await.contains_key(delivery_id)
    }

    /// Gets the queue length.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Checks if the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::NewEndpoint;
    use cityforge_events::{EventFactory, EventType};

    fn entry() -> QueuedDelivery {
        let endpoint = NewEndpoint::new("hooks", "https://example.com").build();
        let event = EventFactory::default().create(EventType::UserRegistered, serde_json::Value::Null);
        let payload: Arc<str> = event.to_json().unwrap().into();
        let delivery = Delivery::new(&endpoint, &event);
        QueuedDelivery::new(delivery, endpoint, Arc::new(event), payload)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = RetryQueue::new();
        let entry = entry();
        let id = entry.delivery.id.clone();
        queue.insert(entry).await;

        let claimed = queue.claim(&id).await;
        assert!(claimed.is_some());
        assert!(queue.claim(&id).await.is_none());

        queue.release(claimed.unwrap().delivery).await;
        assert!(queue.claim(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_claim_requires_pending() {
        let queue = RetryQueue::new();
        let mut entry = entry();
        entry.delivery.status = DeliveryStatus::Retrying;
        let id = entry.delivery.id.clone();
        queue.insert(entry).await;

        assert!(queue.claim(&id).await.is_none());
        assert!(queue.claim("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_due_respects_next_retry_at() {
        let queue = RetryQueue::new();
        let now = Utc::now();

        let mut later = entry();
        later.delivery.next_retry_at = Some(now + chrono::Duration::hours(1));
        let mut ready = entry();
        ready.delivery.next_retry_at = Some(now - chrono::Duration::seconds(1));
        let ready_id = ready.delivery.id.clone();

        queue.insert(later).await;
        queue.insert(ready).await;

        let due = queue.due(now).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].delivery.id, ready_id);

        // Claimed entries are not offered to the sweep.
        queue.claim(&ready_id).await.unwrap();
        assert!(queue.due(now).await.is_empty());

        assert!(queue.remove(&ready_id).await.is_some());
        assert_eq!(queue.len().await, 1);
    }
}
