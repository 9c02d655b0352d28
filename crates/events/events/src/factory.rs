//! Event factory.

use chrono::{SubsecRound, Utc};
use serde_json::Value;

use crate::error::EventResult;
use crate::event::{Event, EventSource, EventType};
use crate::payload::EventPayload;

/// Builds event envelopes stamped with the deployment's environment and source.
#[derive(Debug, Clone)]
pub struct EventFactory {
    environment: String,
    source: EventSource,
}

impl EventFactory {
    /// Creates a factory for the given environment.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            source: EventSource::default(),
        }
    }

    /// Sets the source descriptor.
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    /// Returns the environment stamped on events.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the source stamped on events.
    pub fn source(&self) -> &EventSource {
        &self.source
    }

    /// Creates an event. The shape of `data` is the caller's responsibility.
    pub fn create(&self, event_type: EventType, data: Value) -> Event {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            data,
            timestamp: Utc::now().trunc_subsecs(3),
            environment: self.environment.clone(),
            source: self.source.clone(),
        }
    }

    /// Creates an event from a typed payload.
    pub fn create_typed<P: EventPayload>(&self, payload: &P) -> EventResult<Event> {
        let data = serde_json::to_value(payload)?;
        Ok(self.create(P::EVENT_TYPE, data))
    }
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new("development")
    }
}
