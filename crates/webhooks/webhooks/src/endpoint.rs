//! Webhook endpoint configuration.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use cityforge_events::EventType;

use crate::error::{WebhookError, WebhookResult};
use crate::retry::RetryPolicy;

/// Default request timeout.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Header names the delivery engine sets itself.
///
/// Custom headers may not use these names (compared case-insensitively).
pub const RESERVED_HEADERS: [&str; 6] = [
    "content-type",
    "user-agent",
    "x-event",
    "x-delivery",
    "x-timestamp",
    "x-signature",
];

/// Checks whether a header name is reserved for the delivery engine.
pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name.trim()))
}

/// A registered external subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Shared secret for signing payloads. Unsigned when absent.
    pub secret: Option<String>,
    /// Whether this endpoint receives deliveries.
    pub enabled: bool,
    /// Event types this endpoint receives.
    pub subscribed_event_types: BTreeSet<EventType>,
    /// Extra headers to include in requests.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// Retry policy. [`RetryPolicy::default`] applies when absent.
    pub retry_policy: Option<RetryPolicy>,
    /// Hard request timeout in seconds.
    pub timeout_seconds: u64,
    /// When the endpoint was created.
    pub created_at: DateTime<Utc>,
    /// When the endpoint was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Checks if this endpoint should receive an event.
    pub fn should_receive(&self, event_type: EventType) -> bool {
        self.enabled && self.subscribed_event_types.contains(&event_type)
    }

    /// Returns the retry policy in effect.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.unwrap_or_default()
    }

    /// Checks the invariants the registry enforces on every write.
    pub fn validate(&self) -> WebhookResult<()> {
        if self.name.trim().is_empty() {
            return Err(WebhookError::InvalidEndpoint("name must not be empty".into()));
        }

        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| WebhookError::InvalidEndpoint(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::InvalidEndpoint(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        if self.timeout_seconds == 0 {
            return Err(WebhookError::InvalidEndpoint("timeout must be at least one second".into()));
        }

        if let Some(policy) = &self.retry_policy {
            if policy.max_retries == 0 {
                return Err(WebhookError::InvalidEndpoint("max_retries must be at least 1".into()));
            }
        }

        if let Some(name) = self.custom_headers.keys().find(|name| is_reserved_header(name)) {
            return Err(WebhookError::ReservedHeader(name.clone()));
        }

        for (name, value) in &self.custom_headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WebhookError::InvalidEndpoint(format!("invalid header name '{}'", name)))?;
            HeaderValue::from_str(value)
                .map_err(|_| WebhookError::InvalidEndpoint(format!("invalid value for header '{}'", name)))?;
        }

        Ok(())
    }
}

/// Input for registering an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub subscribed_event_types: BTreeSet<EventType>,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl NewEndpoint {
    /// Starts describing an endpoint.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            secret: None,
            enabled: true,
            subscribed_event_types: BTreeSet::new(),
            custom_headers: HashMap::new(),
            retry_policy: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    /// Sets the signing secret.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Subscribes to specific events.
    pub fn events(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.subscribed_event_types.extend(events);
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the timeout in seconds.
    pub fn timeout_seconds(mut self, timeout: u64) -> Self {
        self.timeout_seconds = timeout;
        self
    }

    /// Disables the endpoint.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Assigns an id and timestamps.
    pub fn build(self) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            url: self.url,
            secret: self.secret,
            enabled: self.enabled,
            subscribed_event_types: self.subscribed_event_types,
            custom_headers: self.custom_headers,
            retry_policy: self.retry_policy,
            timeout_seconds: self.timeout_seconds,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of an endpoint. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    /// `Some(None)` removes the secret.
    pub secret: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub subscribed_event_types: Option<BTreeSet<EventType>>,
    pub custom_headers: Option<HashMap<String, String>>,
    /// `Some(None)` falls back to the default policy.
    pub retry_policy: Option<Option<RetryPolicy>>,
    pub timeout_seconds: Option<u64>,
}

impl EndpointUpdate {
    /// Applies the update in place and bumps `updated_at`.
    pub fn apply_to(self, endpoint: &mut Endpoint) {
        if let Some(name) = self.name {
            endpoint.name = name;
        }
        if let Some(url) = self.url {
            endpoint.url = url;
        }
        if let Some(secret) = self.secret {
            endpoint.secret = secret;
        }
        if let Some(enabled) = self.enabled {
            endpoint.enabled = enabled;
        }
        if let Some(events) = self.subscribed_event_types {
            endpoint.subscribed_event_types = events;
        }
        if let Some(headers) = self.custom_headers {
            endpoint.custom_headers = headers;
        }
        if let Some(policy) = self.retry_policy {
            endpoint.retry_policy = policy;
        }
        if let Some(timeout) = self.timeout_seconds {
            endpoint.timeout_seconds = timeout;
        }
        endpoint.updated_at = Utc::now();
    }
}
