//! Jitter applied to retry delays so that many clients do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Randomization of a computed delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the delay as computed.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

impl JitterPolicy {
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.gen_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.gen_range(0..=half))
            }
        }
    }
}
