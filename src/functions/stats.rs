//! Rating and interest statistics per event.
//!
//! Rows are keyed so that applying the same event twice leaves the
//! aggregates unchanged: reviews by review id, interests by user id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::error::StoreError;
use crate::events::InterestStatus;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStats {
    /// `None` while the event has no reviews.
    pub average_rating: Option<f64>,
    pub total_reviews: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestStats {
    pub total_interested: u64,
    pub total_going: u64,
}

/// Read model the handlers keep up to date.
pub trait StatsStore: Send + Sync {
    fn record_event(&self, event_id: i64, organizer_id: &str) -> Result<(), StoreError>;

    fn organizer(&self, event_id: i64) -> Result<Option<String>, StoreError>;

    /// Insert or replace a review; returns the event's new aggregates.
    fn upsert_review(&self, event_id: i64, review_id: i64, rating: u8) -> Result<ReviewStats, StoreError>;

    fn review_stats(&self, event_id: i64) -> Result<ReviewStats, StoreError>;

    /// Set a user's status on an event; returns the event's new totals.
    fn upsert_interest(
        &self,
        event_id: i64,
        user_id: &str,
        status: InterestStatus,
    ) -> Result<InterestStats, StoreError>;

    fn interest_stats(&self, event_id: i64) -> Result<InterestStats, StoreError>;
}

#[derive(Default)]
struct StatsState {
    organizers: HashMap<i64, String>,
    reviews: HashMap<i64, HashMap<i64, u8>>,
    interests: HashMap<i64, HashMap<String, InterestStatus>>,
}

impl StatsState {
    fn review_stats(&self, event_id: i64) -> ReviewStats {
        let Some(reviews) = self.reviews.get(&event_id).filter(|r| !r.is_empty()) else {
            return ReviewStats::default();
        };
        let sum: u64 = reviews.values().map(|r| u64::from(*r)).sum();
        let total = reviews.len() as u64;
        ReviewStats {
            average_rating: Some(sum as f64 / total as f64),
            total_reviews: total,
        }
    }

    fn interest_stats(&self, event_id: i64) -> InterestStats {
        let mut stats = InterestStats::default();
        for status in self.interests.get(&event_id).into_iter().flat_map(|m| m.values()) {
            match status {
                InterestStatus::Interested => stats.total_interested += 1,
                InterestStatus::Going => stats.total_going += 1,
            }
        }
        stats
    }
}

/// HashMap-backed [`StatsStore`]. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryStats {
    state: Arc<RwLock<StatsState>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StatsState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StatsState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))
    }
}

impl StatsStore for InMemoryStats {
    fn record_event(&self, event_id: i64, organizer_id: &str) -> Result<(), StoreError> {
        self.write()?
            .organizers
            .insert(event_id, organizer_id.to_string());
        Ok(())
    }

    fn organizer(&self, event_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self.read()?.organizers.get(&event_id).cloned())
    }

    fn upsert_review(&self, event_id: i64, review_id: i64, rating: u8) -> Result<ReviewStats, StoreError> {
        let mut state = self.write()?;
        state
            .reviews
            .entry(event_id)
            .or_default()
            .insert(review_id, rating);
        Ok(state.review_stats(event_id))
    }

    fn review_stats(&self, event_id: i64) -> Result<ReviewStats, StoreError> {
        Ok(self.read()?.review_stats(event_id))
    }

    fn upsert_interest(
        &self,
        event_id: i64,
        user_id: &str,
        status: InterestStatus,
    ) -> Result<InterestStats, StoreError> {
        let mut state = self.write()?;
        state
            .interests
            .entry(event_id)
            .or_default()
            .insert(user_id.to_string(), status);
        Ok(state.interest_stats(event_id))
    }

    fn interest_stats(&self, event_id: i64) -> Result<InterestStats, StoreError> {
        Ok(self.read()?.interest_stats(event_id))
    }
}
