//! Reconnect strategies for the broker connection supervisor.

use std::fmt;
use std::time::Duration;

use super::backoff::BackoffPolicy;

/// Decides how long to wait before the next connection attempt.
///
/// `failures` is the number of consecutive failed connection attempts before
/// this wait; it is `0` after a healthy connection was lost. Returning `None`
/// opens the circuit:
/// the supervisor stops until [`BusClient::reconnect`](crate::bus::BusClient::reconnect)
/// is called.
pub trait ReconnectStrategy: Send + Sync + fmt::Debug {
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// The same delay every time, optionally giving up after `max_attempts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedInterval {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for FixedInterval {
    /// 5 seconds, forever.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

impl ReconnectStrategy for FixedInterval {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        within(self.max_attempts, failures).then_some(self.interval)
    }
}

/// Exponential backoff with jitter, optionally giving up after `max_attempts`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExponentialBackoff {
    pub backoff: BackoffPolicy,
    pub max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        within(self.max_attempts, failures).then(|| self.backoff.delay(failures))
    }
}

fn within(max_attempts: Option<u32>, failures: u32) -> bool {
    max_attempts.map_or(true, |max| failures < max)
}
