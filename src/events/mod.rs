//! Domain events exchanged between VIBRA services.
//!
//! Each event type has a payload struct implementing [`DomainEventKind`];
//! [`DomainEvent`] is their sum type and [`EventRegistry`] maps routing keys
//! back to it on the consuming side.

mod model;
mod payloads;
mod registry;

use serde_json::Value;

pub use model::{Event, Interest, Review};
pub use payloads::{
    DomainEventKind, EventCreated, InterestMarked, InterestStatus, ReviewCreated, EVENT_CREATED,
    INTEREST_MARKED, REVIEW_CREATED,
};
pub use registry::{DecodeError, EventRegistry};

/// Every event published on the platform exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    EventCreated(EventCreated),
    ReviewCreated(ReviewCreated),
    InterestMarked(InterestMarked),
}

impl DomainEvent {
    /// Routing key of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::EventCreated(_) => EventCreated::EVENT_TYPE,
            DomainEvent::ReviewCreated(_) => ReviewCreated::EVENT_TYPE,
            DomainEvent::InterestMarked(_) => InterestMarked::EVENT_TYPE,
        }
    }

    /// The payload as it goes into the envelope's `data` field.
    pub fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            DomainEvent::EventCreated(e) => serde_json::to_value(e),
            DomainEvent::ReviewCreated(e) => serde_json::to_value(e),
            DomainEvent::InterestMarked(e) => serde_json::to_value(e),
        }
    }
}

impl From<EventCreated> for DomainEvent {
    fn from(event: EventCreated) -> Self {
        event.into_domain()
    }
}

impl From<ReviewCreated> for DomainEvent {
    fn from(event: ReviewCreated) -> Self {
        event.into_domain()
    }
}

impl From<InterestMarked> for DomainEvent {
    fn from(event: InterestMarked) -> Self {
        event.into_domain()
    }
}
