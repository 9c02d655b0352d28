//! Webhook system - main entry point.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use cityforge_events::{Event, EventPayload, EventType};

use crate::endpoint::{Endpoint, EndpointUpdate, NewEndpoint};
use crate::engine::{DeliveryEngine, DispatchReport, PermanentFailureHook};
use crate::error::WebhookResult;
use crate::registry::EndpointRegistry;
use crate::scheduler::{RetryScheduler, SchedulerHandle};
use crate::storage::{InMemoryLedger, WebhookLedger};

/// Webhook system configuration.
///
/// Read once at startup. Delivery stays off unless explicitly enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Whether events are delivered at all.
    pub enabled: bool,
    /// Whether permanently failed deliveries should fall back to email.
    pub email_fallback: bool,
    /// Environment stamped on every event.
    pub environment: String,
    /// Service name sent in the `User-Agent` header.
    pub service_name: String,
    /// Service version sent in the `User-Agent` header.
    pub service_version: String,
    /// Seconds between retry sweeps.
    pub retry_sweep_interval_secs: u64,
    /// Whether sweeps reload due deliveries from the ledger.
    pub rehydrate_from_ledger: bool,
    /// Maximum deliveries reloaded from the ledger per sweep.
    pub rehydrate_batch_size: usize,
    /// Response bodies are truncated to this many bytes.
    pub max_response_body_bytes: usize,
    /// Terminal deliveries older than this many seconds are purged.
    pub retention_secs: u64,
    /// Seconds between ledger cleanups. Zero disables cleanup.
    pub cleanup_interval_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email_fallback: false,
            environment: "development".to_string(),
            service_name: "CityForge-Webhooks".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            retry_sweep_interval_secs: 10,
            rehydrate_from_ledger: true,
            rehydrate_batch_size: 100,
            max_response_body_bytes: 4096,
            retention_secs: 7 * 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
        }
    }
}

impl WebhookConfig {
    /// Creates a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether delivery is enabled.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets whether email fallback is requested.
    pub fn email_fallback(mut self, email_fallback: bool) -> Self {
        self.email_fallback = email_fallback;
        self
    }

    /// Sets the environment.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Sets the retry sweep interval.
    pub fn retry_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.retry_sweep_interval_secs = secs;
        self
    }

    /// Sets whether sweeps reload due deliveries from the ledger.
    pub fn rehydrate_from_ledger(mut self, rehydrate: bool) -> Self {
        self.rehydrate_from_ledger = rehydrate;
        self
    }

    /// Sets how long terminal deliveries are kept.
    pub fn retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Sets the ledger cleanup interval. Zero disables cleanup.
    pub fn cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Returns the `User-Agent` header value.
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.service_name, self.service_version)
    }

    /// Returns the retry sweep interval.
    pub fn retry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retry_sweep_interval_secs)
    }

    /// Returns the ledger cleanup interval, or `None` when cleanup is off.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }
}

/// The main webhook system.
///
/// Owns the ledger, the endpoint registry, the delivery engine and the
/// retry scheduler's lifecycle.
pub struct WebhookSystem {
    config: WebhookConfig,
    ledger: Arc<dyn WebhookLedger>,
    registry: Arc<EndpointRegistry>,
    engine: DeliveryEngine,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl WebhookSystem {
    /// Creates a webhook system backed by an in-memory ledger.
    pub fn new(config: WebhookConfig) -> WebhookResult<Self> {
        Self::with_ledger(config, Arc::new(InMemoryLedger::new()))
    }

    /// Creates a webhook system over the given ledger.
    pub fn with_ledger(config: WebhookConfig, ledger: Arc<dyn WebhookLedger>) -> WebhookResult<Self> {
        Self::build(config, ledger, None)
    }

    /// Creates a webhook system that reports permanent failures to `hook`.
    pub fn with_failure_hook(
        config: WebhookConfig,
        ledger: Arc<dyn WebhookLedger>,
        hook: Arc<dyn PermanentFailureHook>,
    ) -> WebhookResult<Self> {
        Self::build(config, ledger, Some(hook))
    }

    fn build(
        config: WebhookConfig,
        ledger: Arc<dyn WebhookLedger>,
        hook: Option<Arc<dyn PermanentFailureHook>>,
    ) -> WebhookResult<Self> {
        let registry = Arc::new(EndpointRegistry::new(ledger.clone()));
        let mut builder = DeliveryEngine::builder(config.clone(), ledger.clone()).registry(registry.clone());
        if let Some(hook) = hook {
            builder = builder.failure_hook(hook);
        }
        let engine = builder.build()?;

        Ok(Self {
            config,
            ledger,
            registry,
            engine,
            scheduler: Mutex::new(None),
        })
    }

    /// Starts the retry scheduler. Does nothing when delivery is disabled or
    /// the scheduler already runs.
    pub async fn start(&self) {
        if !self.config.enabled {
            tracing::info!("webhook delivery disabled; retry scheduler not started");
            return;
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_none() {
            *scheduler = Some(RetryScheduler::new(self.engine.clone()).start());
        }
    }

    /// Stops the retry scheduler, waiting for an in-progress sweep.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.shutdown().await;
        }
    }

    /// Checks whether the retry scheduler is running.
    pub async fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| handle.is_running())
    }

    // ==================== Dispatch ====================

    /// Dispatches an event to every subscribed endpoint. Never fails.
    pub async fn send_event(&self, event: Event) -> DispatchReport {
        self.engine.send_event(event).await
    }

    /// Creates and dispatches an event. Never fails.
    pub async fn create_and_send_event(&self, event_type: EventType, data: Value) -> DispatchReport {
        self.engine.create_and_send_event(event_type, data).await
    }

    /// Creates an event from a typed payload and dispatches it. Never fails.
    pub async fn create_and_send_typed<P: EventPayload>(&self, payload: &P) -> DispatchReport {
        self.engine.create_and_send_typed(payload).await
    }

    /// Dispatches in the background; the caller does not wait.
    pub fn emit(&self, event: Event) -> tokio::task::JoinHandle<DispatchReport> {
        self.engine.emit(event)
    }

    // ==================== Endpoint management ====================

    /// Registers an endpoint.
    pub async fn add_endpoint(&self, endpoint: NewEndpoint) -> WebhookResult<Endpoint> {
        self.registry.add_endpoint(endpoint).await
    }

    /// Updates an endpoint. `Ok(None)` for an unknown id.
    pub async fn update_endpoint(&self, id: &str, update: EndpointUpdate) -> WebhookResult<Option<Endpoint>> {
        self.registry.update_endpoint(id, update).await
    }

    /// Removes an endpoint.
    pub async fn remove_endpoint(&self, id: &str) -> WebhookResult<bool> {
        self.registry.remove_endpoint(id).await
    }

    /// Gets an endpoint.
    pub async fn get_endpoint(&self, id: &str) -> WebhookResult<Option<Endpoint>> {
        self.registry.get_endpoint(id).await
    }

    /// Lists all endpoints.
    pub async fn get_endpoints(&self) -> WebhookResult<Vec<Endpoint>> {
        self.registry.get_endpoints().await
    }

    // ==================== Accessors ====================

    /// Gets the delivery engine.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Gets the endpoint registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Gets the ledger.
    pub fn ledger(&self) -> &Arc<dyn WebhookLedger> {
        &self.ledger
    }

    /// Gets the configuration.
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }
}
