//! Decoder registry: event type → typed [`DomainEvent`].

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use super::payloads::{decode_kind, DomainEventKind, EventCreated, InterestMarked, ReviewCreated};
use super::DomainEvent;

type Decoder = fn(&Value) -> Result<DomainEvent, serde_json::Error>;

/// Error returned when an envelope's data cannot be turned into a domain event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder registered for event type {0:?}")]
    UnknownEventType(String),
    #[error("invalid {event_type} payload: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Maps event types to payload decoders.
///
/// `EventRegistry::standard()` knows the three platform event types. Extra
/// entries can alias a new routing key onto an existing payload shape.
#[derive(Clone, Default)]
pub struct EventRegistry {
    decoders: HashMap<String, Decoder>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.event_types();
        types.sort_unstable();
        f.debug_struct("EventRegistry").field("event_types", &types).finish()
    }
}

impl EventRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `event.created`, `review.created` and `interest.marked`.
    pub fn standard() -> Self {
        Self::new()
            .with::<EventCreated>()
            .with::<ReviewCreated>()
            .with::<InterestMarked>()
    }

    /// Register `E` under its own event type.
    pub fn with<E: DomainEventKind>(self) -> Self {
        self.with_alias::<E>(E::EVENT_TYPE)
    }

    /// Register `E`'s decoder under a different event type.
    pub fn with_alias<E: DomainEventKind>(mut self, event_type: &str) -> Self {
        self.decoders.insert(event_type.to_string(), decode_kind::<E>);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn event_types(&self) -> Vec<&str> {
        self.decoders.keys().map(String::as_str).collect()
    }

    /// Decode `data` according to `event_type`.
    pub fn decode(&self, event_type: &str, data: &Value) -> Result<DomainEvent, DecodeError> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownEventType(event_type.to_string()))?;

        decoder(data).map_err(|source| DecodeError::InvalidPayload {
            event_type: event_type.to_string(),
            source,
        })
    }
}
