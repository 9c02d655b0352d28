//! Event error types.

use thiserror::Error;

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;

/// Error type for building and parsing events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Event serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event type tag is not one the platform emits.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
