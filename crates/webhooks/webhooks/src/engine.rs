//! Delivery engine: dispatch, attempt and retry of outbound webhooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cityforge_events::{Event, EventFactory, EventPayload, EventType};

use crate::delivery::{Delivery, DeliveryError, DeliveryOutcome, ResponseInfo, truncate_body};
use crate::endpoint::{Endpoint, is_reserved_header};
use crate::error::WebhookResult;
use crate::queue::{QueuedDelivery, RetryQueue};
use crate::registry::EndpointRegistry;
use crate::signature::WebhookSigner;
use crate::storage::WebhookLedger;
use crate::system::WebhookConfig;

/// Receives deliveries that will never be retried again.
#[async_trait]
pub trait PermanentFailureHook: Send + Sync {
    /// Called once per delivery, after its failed state was persisted.
    async fn on_permanent_failure(&self, delivery: &Delivery);
}

/// Result of dispatching one event.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// The dispatched event, if one could be built.
    pub event_id: Option<String>,
    /// Delivery is globally disabled; nothing happened.
    pub disabled: bool,
    /// Outcome of each matching endpoint's first attempt.
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DispatchReport {
    fn empty(event_id: Option<String>) -> Self {
        Self {
            event_id,
            ..Default::default()
        }
    }

    /// Number of deliveries created.
    pub fn delivery_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Number of deliveries that succeeded on the first attempt.
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_delivered()).count()
    }
}

/// Result of one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was running; this one did nothing.
    pub overlapped: bool,
    /// Deliveries reloaded from the ledger into the queue.
    pub rehydrated: usize,
    /// Attempts made.
    pub attempted: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    /// Deliveries that became failed, with or without an attempt.
    pub failed: usize,
    pub skipped: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                self.attempted += 1;
                self.delivered += 1;
            }
            DeliveryOutcome::RetryScheduled { .. } => {
                self.attempted += 1;
                self.rescheduled += 1;
            }
            DeliveryOutcome::Failed { attempt, .. } => {
                if *attempt > 0 {
                    self.attempted += 1;
                }
                self.failed += 1;
            }
            DeliveryOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Why an attempt failed, with the response when there was one.
struct AttemptFailure {
    error: DeliveryError,
    response: Option<ResponseInfo>,
}

impl From<DeliveryError> for AttemptFailure {
    fn from(error: DeliveryError) -> Self {
        Self { error, response: None }
    }
}

/// Resets the sweep flag when a sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct EngineInner {
    config: WebhookConfig,
    factory: EventFactory,
    ledger: Arc<dyn WebhookLedger>,
    registry: Arc<EndpointRegistry>,
    queue: Arc<RetryQueue>,
    client: reqwest::Client,
    user_agent: String,
    failure_hook: Option<Arc<dyn PermanentFailureHook>>,
    sweeping: AtomicBool,
}

/// Webhook delivery engine.
///
/// Cheap to clone; clones share the queue, registry and HTTP client.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`DeliveryEngine`].
pub struct DeliveryEngineBuilder {
    config: WebhookConfig,
    ledger: Arc<dyn WebhookLedger>,
    registry: Option<Arc<EndpointRegistry>>,
    factory: Option<EventFactory>,
    failure_hook: Option<Arc<dyn PermanentFailureHook>>,
}

impl DeliveryEngineBuilder {
    /// Uses an existing registry instead of creating one over the ledger.
    pub fn registry(mut self, registry: Arc<EndpointRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the event factory used by `create_and_send_*`.
    pub fn factory(mut self, factory: EventFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Installs a permanent failure hook.
    pub fn failure_hook(mut self, hook: Arc<dyn PermanentFailureHook>) -> Self {
        self.failure_hook = Some(hook);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> WebhookResult<DeliveryEngine> {
        let client = reqwest::Client::builder().build()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(EndpointRegistry::new(self.ledger.clone())));
        let factory = self
            .factory
            .unwrap_or_else(|| EventFactory::new(self.config.environment.clone()));
        let user_agent = self.config.user_agent();

        Ok(DeliveryEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                factory,
                ledger: self.ledger,
                registry,
                queue: RetryQueue::shared(),
                client,
                user_agent,
                failure_hook: self.failure_hook,
                sweeping: AtomicBool::new(false),
            }),
        })
    }
}

impl DeliveryEngine {
    /// Starts building an engine.
    pub fn builder(config: WebhookConfig, ledger: Arc<dyn WebhookLedger>) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder {
            config,
            ledger,
            registry: None,
            factory: None,
            failure_hook: None,
        }
    }

    /// Creates an engine with its own registry over `ledger`.
    pub fn new(config: WebhookConfig, ledger: Arc<dyn WebhookLedger>) -> WebhookResult<Self> {
        Self::builder(config, ledger).build()
    }

    // ==================== Dispatch ====================

    /// Dispatches an event to every enabled endpoint subscribed to its type.
    ///
    /// Never fails: persistence and delivery errors are logged, and each
    /// endpoint's fate is reported in the returned outcomes. Endpoints are
    /// attempted concurrently and independently.
    pub async fn send_event(&self, event: Event) -> DispatchReport {
        let event_id = Some(event.id.clone());

        if !self.inner.config.enabled {
            debug!(event_id = %event.id, event_type = %event.event_type, "webhook delivery disabled; event dropped");
            return DispatchReport {
                disabled: true,
                ..DispatchReport::empty(event_id)
            };
        }

        let payload: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!(event_id = %event.id, error = %e, "failed to serialize event");
                return DispatchReport::empty(event_id);
            }
        };

        if let Err(e) = self.inner.ledger.save_event(&event).await {
            error!(event_id = %event.id, error = %e, "failed to persist event; delivering anyway");
        }

        let endpoints = match self.inner.registry.subscribed_endpoints(event.event_type).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "failed to load subscribed endpoints");
                return DispatchReport::empty(event_id);
            }
        };

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            endpoints = endpoints.len(),
            "dispatching event"
        );

        // Attempts are detached tasks: dropping this future stops the wait,
        // not the deliveries.
        let event = Arc::new(event);
        let handles: Vec<JoinHandle<DeliveryOutcome>> = endpoints
            .into_iter()
            .map(|endpoint| {
                let engine = self.clone();
                let event = event.clone();
                let payload = payload.clone();
                tokio::spawn(async move { engine.start_delivery(endpoint, event, payload).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(event_id = %event.id, error = %e, "delivery task aborted"),
            }
        }

        DispatchReport {
            event_id,
            disabled: false,
            outcomes,
        }
    }

    /// Creates an event and dispatches it. Never fails.
    pub async fn create_and_send_event(&self, event_type: EventType, data: Value) -> DispatchReport {
        let event = self.inner.factory.create(event_type, data);
        self.send_event(event).await
    }

    /// Creates an event from a typed payload and dispatches it. Never fails.
    pub async fn create_and_send_typed<P: EventPayload>(&self, payload: &P) -> DispatchReport {
        match self.inner.factory.create_typed(payload) {
            Ok(event) => self.send_event(event).await,
            Err(e) => {
                error!(event_type = %P::EVENT_TYPE, error = %e, "failed to build event");
                DispatchReport::empty(None)
            }
        }
    }

    /// Dispatches in the background for callers that must not wait.
    pub fn emit(&self, event: Event) -> JoinHandle<DispatchReport> {
        let engine = self.clone();
        tokio::spawn(async move { engine.send_event(event).await })
    }

    async fn start_delivery(&self, endpoint: Endpoint, event: Arc<Event>, payload: Arc<str>) -> DeliveryOutcome {
        let delivery = Delivery::new(&endpoint, &event);
        let delivery_id = delivery.id.clone();

        if let Err(e) = self.inner.ledger.insert_delivery(&delivery).await {
            error!(delivery_id = %delivery_id, endpoint_id = %endpoint.id, error = %e, "failed to persist delivery");
        }

        self.inner
            .queue
            .insert(QueuedDelivery::new(delivery, endpoint, event, payload))
            .await;

        self.run_attempt(&delivery_id).await
    }

    // ==================== Attempt ====================

    /// Makes one attempt at a queued, pending delivery.
    ///
    /// Returns [`DeliveryOutcome::Skipped`] if the delivery is not in the
    /// queue, not pending, or already being attempted. The attempt runs as
    /// its own task, so it completes even if the caller stops waiting.
    pub async fn attempt_delivery(&self, delivery_id: &str) -> DeliveryOutcome {
        let engine = self.clone();
        let id = delivery_id.to_string();
        match tokio::spawn(async move { engine.run_attempt(&id).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(delivery_id = %delivery_id, error = %e, "delivery task aborted");
                DeliveryOutcome::Skipped {
                    delivery_id: delivery_id.to_string(),
                }
            }
        }
    }

    async fn run_attempt(&self, delivery_id: &str) -> DeliveryOutcome {
        let Some(entry) = self.inner.queue.claim(delivery_id).await else {
            debug!(delivery_id = %delivery_id, "delivery not claimable; skipping attempt");
            return DeliveryOutcome::Skipped {
                delivery_id: delivery_id.to_string(),
            };
        };

        let mut delivery = entry.delivery;
        let endpoint = entry.endpoint;

        delivery.begin_attempt(Utc::now());
        self.inner.queue.update(&delivery).await;
        self.persist(&delivery).await;

        let result = self.send(&endpoint, &entry.event, &entry.payload, &delivery.id).await;
        let now = Utc::now();

        match result {
            Ok(response) => {
                let status = response.status;
                delivery.record_success(response, now);
                self.persist(&delivery).await;
                self.inner.queue.remove(&delivery.id).await;

                info!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    event_id = %delivery.event_id,
                    attempt = delivery.attempt,
                    status,
                    "webhook delivered"
                );
                DeliveryOutcome::Delivered {
                    delivery_id: delivery.id,
                    status,
                }
            }
            Err(failure) => {
                let policy = endpoint.effective_retry_policy();
                match delivery.record_failure(&failure.error, failure.response, &policy, now) {
                    Some(next_retry_at) => {
                        self.persist(&delivery).await;
                        self.inner.queue.release(delivery.clone()).await;

                        warn!(
                            delivery_id = %delivery.id,
                            endpoint_id = %endpoint.id,
                            attempt = delivery.attempt,
                            max_retries = delivery.max_retries,
                            next_retry_at = %next_retry_at,
                            error = %failure.error,
                            "webhook delivery failed; retry scheduled"
                        );
                        DeliveryOutcome::RetryScheduled {
                            delivery_id: delivery.id,
                            attempt: delivery.attempt,
                            next_retry_at,
                            error: failure.error,
                        }
                    }
                    None => {
                        self.persist(&delivery).await;
                        self.inner.queue.remove(&delivery.id).await;
                        self.permanent_failure(&delivery).await;

                        DeliveryOutcome::Failed {
                            delivery_id: delivery.id,
                            attempt: delivery.attempt,
                            error: failure.error.to_string(),
                        }
                    }
                }
            }
        }
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        event: &Event,
        payload: &str,
        delivery_id: &str,
    ) -> Result<ResponseInfo, AttemptFailure> {
        let headers = to_header_map(delivery_headers(
            &self.inner.user_agent,
            endpoint,
            event,
            payload,
            delivery_id,
        ))?;

        let request = self
            .inner
            .client
            .post(&endpoint.url)
            .headers(headers)
            .body(payload.to_string());
        let max_body = self.inner.config.max_response_body_bytes;

        let exchange = async {
            let mut response = request.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = read_body_capped(&mut response, max_body).await;
            Ok::<_, reqwest::Error>(ResponseInfo { status, headers, body })
        };

        // Dropping the future on expiry cancels the in-flight request.
        let timeout = Duration::from_secs(endpoint.timeout_seconds);
        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(DeliveryError::Timeout {
                seconds: endpoint.timeout_seconds,
            }
            .into()),
            Ok(Err(e)) => Err(classify_client_error(&e, endpoint.timeout_seconds).into()),
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(AttemptFailure {
                error: DeliveryError::Status {
                    status: response.status,
                },
                response: Some(response),
            }),
        }
    }

    async fn persist(&self, delivery: &Delivery) {
        if let Err(e) = self.inner.ledger.update_delivery(delivery).await {
            error!(
                delivery_id = %delivery.id,
                status = %delivery.status,
                error = %e,
                "failed to persist delivery state"
            );
        }
    }

    async fn permanent_failure(&self, delivery: &Delivery) {
        error!(
            delivery_id = %delivery.id,
            endpoint_id = %delivery.endpoint_id,
            event_id = %delivery.event_id,
            attempt = delivery.attempt,
            error = delivery.error_message.as_deref().unwrap_or("unknown"),
            "webhook delivery permanently failed"
        );

        match &self.inner.failure_hook {
            Some(hook) => hook.on_permanent_failure(delivery).await,
            None if self.inner.config.email_fallback => {
                warn!(delivery_id = %delivery.id, "email fallback enabled but no fallback notifier is installed");
            }
            None => {}
        }
    }

    /// Fails a queued delivery without attempting it.
    async fn abandon(&self, delivery_id: &str, reason: &str) -> DeliveryOutcome {
        let Some(entry) = self.inner.queue.claim(delivery_id).await else {
            return DeliveryOutcome::Skipped {
                delivery_id: delivery_id.to_string(),
            };
        };

        let mut delivery = entry.delivery;
        delivery.abandon(reason, Utc::now());
        self.persist(&delivery).await;
        self.inner.queue.remove(&delivery.id).await;
        self.permanent_failure(&delivery).await;

        DeliveryOutcome::Failed {
            delivery_id: delivery.id,
            attempt: delivery.attempt,
            error: reason.to_string(),
        }
    }

    // ==================== Retry sweep ====================

    /// Re-attempts every pending delivery whose retry time has come.
    ///
    /// Returns immediately with `overlapped` set if another sweep is still
    /// running. Before each retry the endpoint is re-read from the registry;
    /// deliveries whose endpoint was removed or disabled are failed.
    pub async fn process_due_retries(&self) -> SweepReport {
        if self
            .inner
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("retry sweep already running; skipping");
            return SweepReport {
                overlapped: true,
                ..Default::default()
            };
        }
        let _guard = SweepGuard(&self.inner.sweeping);

        let now = Utc::now();
        let mut report = SweepReport::default();

        if self.inner.config.rehydrate_from_ledger {
            self.rehydrate(now, &mut report).await;
        }

        let mut handles: Vec<JoinHandle<DeliveryOutcome>> = Vec::new();
        for entry in self.inner.queue.due(now).await {
            let delivery_id = entry.delivery.id.clone();

            let abandon_reason = match self.inner.registry.get_endpoint(&entry.delivery.endpoint_id).await {
                Ok(Some(endpoint)) if endpoint.enabled => {
                    self.inner.queue.refresh_endpoint(&delivery_id, endpoint).await;
                    None
                }
                Ok(Some(_)) => Some("endpoint disabled"),
                Ok(None) => Some("endpoint no longer exists"),
                Err(e) => {
                    warn!(delivery_id = %delivery_id, error = %e, "failed to refresh endpoint; retrying with cached configuration");
                    None
                }
            };

            // Claimed work runs detached so a dropped sweep never strands a claim.
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                match abandon_reason {
                    Some(reason) => engine.abandon(&delivery_id, reason).await,
                    None => engine.run_attempt(&delivery_id).await,
                }
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => error!(error = %e, "retry task aborted"),
            }
        }

        if report.attempted > 0 || report.failed > 0 || report.rehydrated > 0 {
            info!(
                rehydrated = report.rehydrated,
                attempted = report.attempted,
                delivered = report.delivered,
                rescheduled = report.rescheduled,
                failed = report.failed,
                "retry sweep finished"
            );
        }
        report
    }

    /// Loads due deliveries that exist only in the ledger back into the queue.
    async fn rehydrate(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let due = match self
            .inner
            .ledger
            .list_due_deliveries(now, self.inner.config.rehydrate_batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to load due deliveries from ledger");
                return;
            }
        };

        for mut delivery in due {
            if self.inner.queue.contains(&delivery.id).await {
                continue;
            }

            let endpoint = self.inner.registry.get_endpoint(&delivery.endpoint_id).await;
            let event = self.inner.ledger.get_event(&delivery.event_id).await;

            match (endpoint, event) {
                (Ok(Some(endpoint)), Ok(Some(event))) => {
                    let payload: Arc<str> = match event.to_json() {
                        Ok(json) => json.into(),
                        Err(e) => {
                            warn!(delivery_id = %delivery.id, error = %e, "failed to serialize stored event");
                            continue;
                        }
                    };
                    debug!(delivery_id = %delivery.id, "rehydrated delivery from ledger");
                    self.inner
                        .queue
                        .insert(QueuedDelivery::new(delivery, endpoint, Arc::new(event), payload))
                        .await;
                    report.rehydrated += 1;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(delivery_id = %delivery.id, error = %e, "failed to rehydrate delivery; will retry next sweep");
                }
                (Ok(endpoint), Ok(event)) => {
                    let reason = if endpoint.is_none() {
                        "endpoint no longer exists"
                    } else if event.is_none() {
                        "event no longer exists"
                    } else {
                        continue;
                    };
                    delivery.abandon(reason, now);
                    self.persist(&delivery).await;
                    self.permanent_failure(&delivery).await;
                    report.failed += 1;
                }
            }
        }
    }

    /// Purges terminal deliveries older than the configured retention.
    /// Returns how many were removed; ledger errors are logged and count as zero.
    pub async fn cleanup_terminal(&self) -> usize {
        let cutoff = i64::try_from(self.inner.config.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        match self.inner.ledger.cleanup_terminal_deliveries(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, cutoff = %cutoff, "purged terminal deliveries");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "failed to purge terminal deliveries");
                0
            }
        }
    }

    // ==================== Accessors ====================

    /// Gets the retry queue.
    pub fn queue(&self) -> &RetryQueue {
        &self.inner.queue
    }

    /// Gets the endpoint registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    /// Gets the ledger.
    pub fn ledger(&self) -> &Arc<dyn WebhookLedger> {
        &self.inner.ledger
    }

    /// Gets the configuration.
    pub fn config(&self) -> &WebhookConfig {
        &self.inner.config
    }
}

/// Builds the outbound request headers, in the order they are applied.
///
/// Custom headers come last and never replace a system header: names that
/// collide with a reserved header are dropped.
pub fn delivery_headers(
    user_agent: &str,
    endpoint: &Endpoint,
    event: &Event,
    payload: &str,
    delivery_id: &str,
) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("User-Agent".to_string(), user_agent.to_string()),
        ("X-Event".to_string(), event.event_type.as_str().to_string()),
        ("X-Delivery".to_string(), delivery_id.to_string()),
        ("X-Timestamp".to_string(), event.timestamp_header()),
    ];

    if let Some(secret) = endpoint.secret.as_deref().filter(|s| !s.is_empty()) {
        let signature = WebhookSigner::new(secret).sign(payload.as_bytes());
        headers.push(("X-Signature".to_string(), signature));
    }

    for (name, value) in &endpoint.custom_headers {
        if is_reserved_header(name) {
            warn!(endpoint_id = %endpoint.id, header = %name, "ignoring custom header that overrides a system header");
            continue;
        }
        headers.push((name.clone(), value.clone()));
    }

    headers
}

fn to_header_map(headers: Vec<(String, String)>) -> Result<HeaderMap, DeliveryError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DeliveryError::Request(format!("invalid header name '{}': {}", name, e)))?;
        let header_value = HeaderValue::from_str(&value)
            .map_err(|e| DeliveryError::Request(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Reads at most `max_bytes` of the response body and drops the rest unread.
async fn read_body_capped(response: &mut reqwest::Response, max_bytes: usize) -> Option<String> {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < max_bytes {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(max_bytes - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "failed to read response body");
                if buf.is_empty() {
                    return None;
                }
                break;
            }
        }
    }
    Some(truncate_body(&String::from_utf8_lossy(&buf), max_bytes))
}

fn classify_client_error(err: &reqwest::Error, timeout_seconds: u64) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout {
            seconds: timeout_seconds,
        }
    } else if err.is_builder() {
        DeliveryError::Request(err.to_string())
    } else {
        DeliveryError::Network(err.to_string())
    }
}
