//! Retry policies: reconnecting to the broker and redelivering failed messages.

mod backoff;
mod jitter;
mod reconnect;
mod redelivery;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use reconnect::{ExponentialBackoff, FixedInterval, ReconnectStrategy};
pub use redelivery::{Redelivery, RedeliveryPolicy};
