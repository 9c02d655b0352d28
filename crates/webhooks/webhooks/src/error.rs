//! Webhook error types.

use thiserror::Error;

/// Result type for webhook operations.
pub type WebhookResult<T> = Result<T, WebhookError>;

/// Error type for webhook operations.
///
/// Only foreground calls (endpoint management, receiver-side verification,
/// ledger access) return these. Dispatch never surfaces them to the caller.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Invalid signature.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature header absent on a request that must be signed.
    #[error("Missing signature")]
    MissingSignature,

    /// Invalid payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Endpoint configuration failed validation.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Custom header collides with a header the system sets itself.
    #[error("Custom header '{0}' is reserved")]
    ReservedHeader(String),

    /// Ledger read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

impl From<cityforge_events::EventError> for WebhookError {
    fn from(err: cityforge_events::EventError) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        WebhookError::Client(err.to_string())
    }
}
