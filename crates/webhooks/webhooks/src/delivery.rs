//! Delivery records and the per-attempt state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use cityforge_events::{Event, EventType};

use crate::endpoint::Endpoint;
use crate::retry::RetryPolicy;

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for its first or next attempt.
    Pending,
    /// An attempt is in progress.
    Retrying,
    /// Successfully delivered.
    Delivered,
    /// Failed after all retries.
    Failed,
}

impl DeliveryStatus {
    /// Delivered and failed records never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }

    /// Returns the lowercase name stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No response within the endpoint's timeout; the request was cancelled.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Connection, DNS or TLS failure.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// The request could not be built or serialized.
    #[error("invalid request: {0}")]
    Request(String),
}

/// Response metadata captured from an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl ResponseInfo {
    /// Checks for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One attempt lineage of delivering one event to one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Delivery ID, sent as `X-Delivery` for receiver-side dedup.
    pub id: String,
    pub endpoint_id: String,
    pub event_id: String,
    pub event_type: EventType,
    pub status: DeliveryStatus,
    /// Attempts made so far.
    pub attempt: u32,
    /// Total attempts allowed, copied from the endpoint's policy.
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery of `event` to `endpoint`.
    pub fn new(endpoint: &Endpoint, event: &Event) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            endpoint_id: endpoint.id.clone(),
            event_id: event.id.clone(),
            event_type: event.event_type,
            status: DeliveryStatus::Pending,
            attempt: 0,
            max_retries: endpoint.effective_retry_policy().max_retries,
            next_retry_at: None,
            last_attempt_at: None,
            response_status: None,
            response_headers: None,
            response_body: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks if the delivery reached delivered or failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Checks if a pending delivery's retry time has come.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Starts an attempt: bumps the counter and marks the record in flight.
    ///
    /// Returns false, changing nothing, unless the delivery is pending.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != DeliveryStatus::Pending {
            return false;
        }
        self.attempt += 1;
        self.last_attempt_at = Some(now);
        self.next_retry_at = None;
        self.status = DeliveryStatus::Retrying;
        self.updated_at = now;
        true
    }

    /// Records a 2xx response. Terminal.
    pub fn record_success(&mut self, response: ResponseInfo, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.capture_response(Some(response));
        self.error_message = None;
        self.next_retry_at = None;
        self.status = DeliveryStatus::Delivered;
        self.updated_at = now;
    }

    /// Records a failed attempt and decides what happens next.
    ///
    /// Returns the scheduled retry time, or `None` when the delivery has
    /// exhausted its attempts and is now failed.
    pub fn record_failure(
        &mut self,
        error: &DeliveryError,
        response: Option<ResponseInfo>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            return None;
        }
        self.capture_response(response);
        self.error_message = Some(error.to_string());
        self.updated_at = now;

        if self.attempt >= self.max_retries {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
            return None;
        }

        let delay = chrono::Duration::from_std(policy.delay_for(self.attempt)).unwrap_or_default();
        let next = now + delay;
        self.status = DeliveryStatus::Pending;
        self.next_retry_at = Some(next);
        Some(next)
    }

    /// Fails the delivery without an attempt (e.g. its endpoint is gone).
    pub fn abandon(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.error_message = Some(reason.into());
        self.next_retry_at = None;
        self.status = DeliveryStatus::Failed;
        self.updated_at = now;
    }

    fn capture_response(&mut self, response: Option<ResponseInfo>) {
        match response {
            Some(response) => {
                self.response_status = Some(response.status);
                self.response_headers = Some(response.headers);
                self.response_body = response.body;
            }
            None => {
                self.response_status = None;
                self.response_headers = None;
                self.response_body = None;
            }
        }
    }
}

/// What a single call to the attempt function did.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// 2xx response; the delivery is terminal.
    Delivered { delivery_id: String, status: u16 },
    /// Failed attempt with attempts left.
    RetryScheduled {
        delivery_id: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        error: DeliveryError,
    },
    /// Attempts exhausted (or endpoint gone); the delivery is terminal.
    Failed {
        delivery_id: String,
        attempt: u32,
        error: String,
    },
    /// Nothing was attempted: unknown id, not pending, or already in flight.
    Skipped { delivery_id: String },
}

impl DeliveryOutcome {
    /// Returns the delivery this outcome belongs to.
    pub fn delivery_id(&self) -> &str {
        match self {
            DeliveryOutcome::Delivered { delivery_id, .. }
            | DeliveryOutcome::RetryScheduled { delivery_id, .. }
            | DeliveryOutcome::Failed { delivery_id, .. }
            | DeliveryOutcome::Skipped { delivery_id } => delivery_id,
        }
    }

    /// Checks for a successful delivery.
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Truncates a response body to at most `max_bytes` on a char boundary.
pub fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut end = max_bytes;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
