//! # CityForge Events
//!
//! Event envelopes for CityForge outbound notifications:
//! - Immutable, typed and timestamped events
//! - Typed payloads bound to their event type
//! - An injectable factory stamping environment and source
//!
//! ## Example
//!
//! ```rust
//! use cityforge_events::{EventFactory, EventType};
//!
//! let factory = EventFactory::new("production");
//! let event = factory.create(
//!     EventType::UserRegistered,
//!     serde_json::json!({ "user_id": 123 }),
//! );
//! assert_eq!(event.event_type.as_str(), "user.registered");
//! ```

mod event;
mod factory;
mod error;
pub mod payload;

pub use event::{Event, EventType, EventSource};
pub use factory::EventFactory;
pub use payload::EventPayload;
pub use error::{EventError, EventResult};
