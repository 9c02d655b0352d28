//! Event envelope and event type tags.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{EventError, EventResult};

/// An immutable record of a business occurrence.
///
/// This is the exact envelope a subscriber receives as the request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event instance.
    pub id: String,
    /// The event type tag.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The event payload. Its shape is keyed by `event_type`.
    pub data: Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Deployment environment that produced the event (e.g. "production").
    pub environment: String,
    /// Service that produced the event.
    pub source: EventSource,
}

impl Event {
    /// Serializes the envelope.
    ///
    /// The returned string is both the request body and the signed bytes,
    /// so callers must not re-serialize between signing and sending.
    pub fn to_json(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an envelope from a request body.
    pub fn from_json(body: &[u8]) -> EventResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns the timestamp as sent in the `X-Timestamp` header.
    ///
    /// Formatted exactly like the body's `timestamp` field.
    pub fn timestamp_header(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// Deserializes the payload to a specific type.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Name and version of the service emitting events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    /// Service name.
    pub name: String,
    /// Service version.
    pub version: String,
}

impl EventSource {
    /// Creates a new source descriptor.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new("cityforge", env!("CARGO_PKG_VERSION"))
    }
}

/// Business occurrences the platform notifies subscribers about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A new account was registered.
    #[serde(rename = "user.registered")]
    UserRegistered,
    /// A user asked for a password reset.
    #[serde(rename = "user.password_reset_requested")]
    PasswordResetRequested,
    /// A business card was submitted for review.
    #[serde(rename = "card.submitted")]
    CardSubmitted,
    /// An edit to an existing card was suggested.
    #[serde(rename = "card.modification_suggested")]
    CardModificationSuggested,
    /// A review was reported for moderation.
    #[serde(rename = "review.reported")]
    ReviewReported,
    /// A forum thread was reported for moderation.
    #[serde(rename = "forum.thread_reported")]
    ForumThreadReported,
    /// A forum post was reported for moderation.
    #[serde(rename = "forum.post_reported")]
    ForumPostReported,
    /// A new forum category was requested.
    #[serde(rename = "forum.category_requested")]
    ForumCategoryRequested,
    /// A help-wanted post was reported for moderation.
    #[serde(rename = "help_wanted.reported")]
    HelpWantedReported,
    /// A support ticket was opened.
    #[serde(rename = "support_ticket.created")]
    SupportTicketCreated,
    /// A support ticket changed status or received a message.
    #[serde(rename = "support_ticket.updated")]
    SupportTicketUpdated,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 11] = [
        EventType::UserRegistered,
        EventType::PasswordResetRequested,
        EventType::CardSubmitted,
        EventType::CardModificationSuggested,
        EventType::ReviewReported,
        EventType::ForumThreadReported,
        EventType::ForumPostReported,
        EventType::ForumCategoryRequested,
        EventType::HelpWantedReported,
        EventType::SupportTicketCreated,
        EventType::SupportTicketUpdated,
    ];

    /// Returns the dotted tag (e.g. "user.registered").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserRegistered => "user.registered",
            EventType::PasswordResetRequested => "user.password_reset_requested",
            EventType::CardSubmitted => "card.submitted",
            EventType::CardModificationSuggested => "card.modification_suggested",
            EventType::ReviewReported => "review.reported",
            EventType::ForumThreadReported => "forum.thread_reported",
            EventType::ForumPostReported => "forum.post_reported",
            EventType::ForumCategoryRequested => "forum.category_requested",
            EventType::HelpWantedReported => "help_wanted.reported",
            EventType::SupportTicketCreated => "support_ticket.created",
            EventType::SupportTicketUpdated => "support_ticket.updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}
