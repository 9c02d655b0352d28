//! Endpoint registry: durable endpoint CRUD with a read-through cache.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use cityforge_events::EventType;

use crate::endpoint::{Endpoint, EndpointUpdate, NewEndpoint};
use crate::error::WebhookResult;
use crate::storage::WebhookLedger;

/// Registry of subscriber endpoints.
///
/// Every write goes to the ledger first; the cache is updated only after the
/// ledger accepted it. Errors propagate: these are foreground administrative
/// calls with no retry behind them.
pub struct EndpointRegistry {
    ledger: Arc<dyn WebhookLedger>,
    cache: RwLock<HashMap<String, Endpoint>>,
}

impl EndpointRegistry {
    /// Creates a registry over a ledger.
    pub fn new(ledger: Arc<dyn WebhookLedger>) -> Self {
        Self {
            ledger,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new endpoint.
    pub async fn add_endpoint(&self, endpoint: NewEndpoint) -> WebhookResult<Endpoint> {
        let endpoint = endpoint.build();
        endpoint.validate()?;

        self.ledger.save_endpoint(&endpoint).await?;
        self.cache
            .write()
            .await
            .insert(endpoint.id.clone(), endpoint.clone());

        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url, "webhook endpoint registered");
        Ok(endpoint)
    }

    /// Applies a partial update. Returns `Ok(None)` for an unknown id.
    pub async fn update_endpoint(&self, id: &str, update: EndpointUpdate) -> WebhookResult<Option<Endpoint>> {
        let Some(mut endpoint) = self.get_endpoint(id).await? else {
            return Ok(None);
        };

        update.apply_to(&mut endpoint);
        endpoint.validate()?;

        self.ledger.save_endpoint(&endpoint).await?;
        self.cache
            .write()
            .await
            .insert(endpoint.id.clone(), endpoint.clone());

        tracing::info!(endpoint_id = %endpoint.id, enabled = endpoint.enabled, "webhook endpoint updated");
        Ok(Some(endpoint))
    }

    /// Removes an endpoint. Returns whether it existed.
    pub async fn remove_endpoint(&self, id: &str) -> WebhookResult<bool> {
        let removed = self.ledger.delete_endpoint(id).await?;
        self.cache.write().await.remove(id);

        if removed {
            tracing::info!(endpoint_id = %id, "webhook endpoint removed");
        }
        Ok(removed)
    }

    /// Gets an endpoint, from the cache when possible.
    pub async fn get_endpoint(&self, id: &str) -> WebhookResult<Option<Endpoint>> {
        if let Some(endpoint) = self.cache.read().await.get(id) {
            return Ok(Some(endpoint.clone()));
        }

        let endpoint = self.ledger.get_endpoint(id).await?;
        if let Some(endpoint) = &endpoint {
            self.cache
                .write()
                .await
                .insert(endpoint.id.clone(), endpoint.clone());
        }
        Ok(endpoint)
    }

    /// Lists all endpoints from the ledger and refreshes the cache.
    pub async fn get_endpoints(&self) -> WebhookResult<Vec<Endpoint>> {
        let endpoints = self.ledger.list_endpoints().await?;

        let mut cache = self.cache.write().await;
        cache.clear();
        cache.extend(endpoints.iter().map(|e| (e.id.clone(), e.clone())));

        Ok(endpoints)
    }

    /// Lists enabled endpoints subscribed to `event_type`.
    pub async fn subscribed_endpoints(&self, event_type: EventType) -> WebhookResult<Vec<Endpoint>> {
        self.ledger.find_subscribed_endpoints(event_type).await
    }
}
