//! Jitter strategies to prevent thundering herds of synchronized retries.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing backoff delays.
///
/// Composable with any of the deterministic backoffs; the randomized backoffs
/// (decorrelated and soft exponential) carry their own built-in jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter, use the exact backoff delay.
    #[default]
    None,
    /// Full jitter: random between 0 and the delay.
    Full,
    /// Equal jitter: random between half the delay and the delay.
    Equal,
}

impl Jitter {
    /// Create a full jitter strategy.
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create an equal jitter strategy.
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-provided RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
        }
    }

    /// Apply jitter in the millisecond domain the backoff sequences operate in.
    pub(crate) fn apply_millis<R: Rng>(&self, millis: f64, rng: &mut R) -> f64 {
        match self {
            Jitter::None => millis,
            Jitter::Full => {
                if millis <= 0.0 {
                    return 0.0;
                }
                rng.random_range(0.0..=millis)
            }
            Jitter::Equal => {
                if millis <= 0.0 {
                    return 0.0;
                }
                let half = millis / 2.0;
                rng.random_range(half..=millis)
            }
        }
    }
}
