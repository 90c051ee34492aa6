//! Exponential backoff: `first × factor^n`, capped at `max`, then jittered.
//!
//! The base delay depends only on the attempt number, so jitter never
//! feeds back into later delays.

use std::time::Duration;

use super::jitter::JitterPolicy;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0.
    pub first: Duration,
    /// Upper bound before jitter.
    pub max: Duration,
    /// Growth per attempt; `1.0` gives a constant delay.
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// 500ms doubling up to 30s, equal jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay, no jitter.
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}
