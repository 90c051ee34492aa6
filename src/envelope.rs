//! Event envelope, the wire format of every domain event on the bus.
//!
//! ```json
//! {
//!   "eventId": "6f1c0a8e-1b7e-4a7e-9d7a-2b1f0e3c4d5a",
//!   "eventType": "review.created",
//!   "timestamp": "2026-10-14T12:00:00.123456Z",
//!   "data": { "reviewId": 1, "eventId": 42, "userId": "u1", "rating": 5 }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusError;

/// Outer wrapper around a domain event payload.
///
/// Created once per publish call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per publish call (UUID v4).
    pub event_id: String,
    /// Dot-delimited event type, also used as the routing key.
    pub event_type: String,
    /// Publish time, RFC 3339 in UTC.
    pub timestamp: DateTime<Utc>,
    /// Payload specific to `event_type`.
    pub data: Value,
}

impl Envelope {
    /// Create an envelope with a fresh event id and the current time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse an envelope from UTF-8 JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Check an event type used as a routing key.
///
/// Segments are separated by `.`, must be non-empty, and may not contain
/// whitespace or the topic wildcards `*` / `#`.
pub fn validate_event_type(event_type: &str) -> Result<(), BusError> {
    if !segments_valid(event_type, false) {
        return Err(BusError::InvalidEventType(event_type.to_string()));
    }
    Ok(())
}

/// Check a binding pattern. Same rules as [`validate_event_type`], except a
/// segment may be exactly `*` or `#`.
pub fn validate_binding_pattern(pattern: &str) -> Result<(), BusError> {
    if !segments_valid(pattern, true) {
        return Err(BusError::InvalidEventType(pattern.to_string()));
    }
    Ok(())
}

fn segments_valid(value: &str, allow_wildcards: bool) -> bool {
    if value.is_empty() {
        return false;
    }
    value.split('.').all(|segment| {
        if segment.is_empty() || segment.chars().any(char::is_whitespace) {
            return false;
        }
        if allow_wildcards && (segment == "*" || segment == "#") {
            return true;
        }
        !segment.contains(['*', '#'])
    })
}
