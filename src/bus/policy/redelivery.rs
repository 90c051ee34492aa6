//! What the consumer does with a message whose handler failed.

use std::time::Duration;

use super::backoff::BackoffPolicy;

/// Redelivery policy for failed handler invocations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RedeliveryPolicy {
    /// Nack with requeue, redelivered immediately and without limit.
    Requeue,
    /// Retry through the queue with a failure counter in the message
    /// headers; after `max_attempts` failures the message is dead-lettered.
    Bounded {
        max_attempts: u32,
        backoff: BackoffPolicy,
    },
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::bounded(5)
    }
}

/// Outcome of [`RedeliveryPolicy::decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redelivery {
    /// Nack and requeue as-is.
    Requeue,
    /// Republish with the incremented counter after `delay`.
    Retry { delay: Duration },
    /// Move to the dead-letter queue.
    DeadLetter,
}

impl RedeliveryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self::Bounded {
            max_attempts,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(self, backoff: BackoffPolicy) -> Self {
        match self {
            Self::Requeue => Self::Requeue,
            Self::Bounded { max_attempts, .. } => Self::Bounded {
                max_attempts,
                backoff,
            },
        }
    }

    /// `failures` counts failed attempts including the one just made.
    /// Non-retryable failures skip straight to the dead-letter queue
    /// unless the policy is plain requeue.
    pub fn decide(&self, failures: u32, retryable: bool) -> Redelivery {
        match self {
            Self::Requeue => Redelivery::Requeue,
            Self::Bounded { .. } if !retryable => Redelivery::DeadLetter,
            Self::Bounded {
                max_attempts,
                backoff,
            } => {
                if failures >= *max_attempts {
                    Redelivery::DeadLetter
                } else {
                    Redelivery::Retry {
                        delay: backoff.delay(failures.saturating_sub(1)),
                    }
                }
            }
        }
    }
}
