//! Records owned by the events service, as the publisher receives them after a write.
//!
//! Only the fields the domain events project are modelled here.

use serde::{Deserialize, Serialize};

use super::payloads::{EventCreated, InterestMarked, InterestStatus, ReviewCreated};

/// A listed event (concert, meetup, party).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub organizer_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
}

/// A user's review of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: i64,
    pub event_id: i64,
    pub user_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A user's interest in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interest {
    pub event_id: i64,
    pub user_id: String,
    pub status: InterestStatus,
}

impl From<&Event> for EventCreated {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.id,
            name: event.name.clone(),
            organizer_id: event.organizer_id.clone(),
            category: event.category.clone(),
            location: event.location.clone(),
            start_date: event.start_date.clone(),
        }
    }
}

impl From<&Review> for ReviewCreated {
    fn from(review: &Review) -> Self {
        Self {
            review_id: review.id,
            event_id: review.event_id,
            user_id: review.user_id.clone(),
            rating: review.rating,
        }
    }
}

impl From<&Interest> for InterestMarked {
    fn from(interest: &Interest) -> Self {
        Self {
            event_id: interest.event_id,
            user_id: interest.user_id.clone(),
            status: interest.status,
        }
    }
}
