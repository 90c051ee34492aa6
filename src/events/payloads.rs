//! Typed payloads for each published event type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DomainEvent;

pub const EVENT_CREATED: &str = "event.created";
pub const REVIEW_CREATED: &str = "review.created";
pub const INTEREST_MARKED: &str = "interest.marked";

/// A payload type bound to exactly one event type.
///
/// Implemented by every struct that travels in an envelope's `data` field,
/// so publishers, the decoder registry and typed subscriptions agree on the
/// routing key without passing strings around.
pub trait DomainEventKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;

    fn into_domain(self) -> DomainEvent;
}

/// Payload of `event.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCreated {
    pub event_id: i64,
    pub name: String,
    pub organizer_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
}

impl DomainEventKind for EventCreated {
    const EVENT_TYPE: &'static str = EVENT_CREATED;

    fn into_domain(self) -> DomainEvent {
        DomainEvent::EventCreated(self)
    }
}

/// Payload of `review.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCreated {
    pub review_id: i64,
    pub event_id: i64,
    pub user_id: String,
    pub rating: u8,
}

impl DomainEventKind for ReviewCreated {
    const EVENT_TYPE: &'static str = REVIEW_CREATED;

    fn into_domain(self) -> DomainEvent {
        DomainEvent::ReviewCreated(self)
    }
}

/// Attendance intent a user marks on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterestStatus {
    Interested,
    Going,
}

impl InterestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterestStatus::Interested => "interested",
            InterestStatus::Going => "going",
        }
    }
}

/// Payload of `interest.marked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestMarked {
    pub event_id: i64,
    pub user_id: String,
    pub status: InterestStatus,
}

impl DomainEventKind for InterestMarked {
    const EVENT_TYPE: &'static str = INTEREST_MARKED;

    fn into_domain(self) -> DomainEvent {
        DomainEvent::InterestMarked(self)
    }
}

pub(crate) fn decode_kind<E: DomainEventKind>(data: &Value) -> Result<DomainEvent, serde_json::Error> {
    E::deserialize(data).map(E::into_domain)
}
