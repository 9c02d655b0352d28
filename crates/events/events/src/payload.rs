//! Typed payloads for the platform's event sources.
//!
//! Producers that build events through these types get the type tag from the
//! payload itself, so the tag and the data shape cannot disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventType;

/// A payload bound to exactly one event type.
pub trait EventPayload: Serialize {
    /// The tag events carrying this payload are sent with.
    const EVENT_TYPE: EventType;
}

/// Sent when an account is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub registered_at: DateTime<Utc>,
}

impl EventPayload for UserRegistered {
    const EVENT_TYPE: EventType = EventType::UserRegistered;
}

/// Sent when a password reset is requested.
///
/// The reset token itself never leaves the platform; subscribers get a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordResetRequested {
    pub user_id: i64,
    pub email: String,
    pub reset_url: String,
    pub expires_at: DateTime<Utc>,
}

impl EventPayload for PasswordResetRequested {
    const EVENT_TYPE: EventType = EventType::PasswordResetRequested;
}

/// Sent when a directory card is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSubmitted {
    pub submission_id: i64,
    pub name: String,
    pub submitted_by: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl EventPayload for CardSubmitted {
    const EVENT_TYPE: EventType = EventType::CardSubmitted;
}

/// Sent when someone reports content for moderation.
///
/// The same shape is used for reviews, forum threads, forum posts and
/// help-wanted posts; the wrapper types below pick the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentReport {
    pub content_id: i64,
    pub reported_by: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub report_count: u32,
}

macro_rules! report_payload {
    ($(#[$meta:meta])* $name:ident => $event_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub ContentReport);

        impl EventPayload for $name {
            const EVENT_TYPE: EventType = $event_type;
        }
    };
}

report_payload!(
    /// A review was reported.
    ReviewReported => EventType::ReviewReported
);
report_payload!(
    /// A forum thread was reported.
    ForumThreadReported => EventType::ForumThreadReported
);
report_payload!(
    /// A forum post was reported.
    ForumPostReported => EventType::ForumPostReported
);
report_payload!(
    /// A help-wanted post was reported.
    HelpWantedReported => EventType::HelpWantedReported
);

/// Sent when a support ticket is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportTicketCreated {
    pub ticket_id: i64,
    pub title: String,
    pub category: String,
    pub priority: String,
    pub created_by: i64,
}

impl EventPayload for SupportTicketCreated {
    const EVENT_TYPE: EventType = EventType::SupportTicketCreated;
}
