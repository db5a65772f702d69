//! Backoff schedules for retry policies.
//!
//! A [`Backoff`] value describes a schedule; [`Backoff::sequence`] turns it
//! into a stateful [`DelaySequence`] that the retry engine drives. Sequences
//! are restartable: the engine takes a fresh sequence per invocation, and
//! [`DelaySequence::reset`] rewinds one in place. All arithmetic happens in
//! fractional milliseconds; delays are emitted as [`Duration`]s.

use crate::error::ConfigError;
use crate::jitter::Jitter;
use rand::Rng;
use std::time::Duration;

/// Hard cap on any emitted delay, guarding runaway exponential schedules.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_BACKOFF_MILLIS: f64 = (24 * 60 * 60 * 1000) as f64;

/// A restartable, lazy sequence of retry delays.
pub trait DelaySequence: Send {
    /// Produce the next delay in the schedule.
    fn next_delay(&mut self) -> Duration;

    /// Rewind the sequence to its initial state.
    fn reset(&mut self);
}

/// Backoff schedule for retries.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration, jitter: Jitter },
    /// Cycles through a list of delays indefinitely.
    Intervals { delays: Vec<Duration>, jitter: Jitter },
    /// Linearly increasing delay, optionally capped.
    Linear { min: Duration, additive: Duration, max: Option<Duration>, jitter: Jitter },
    /// Exponentially increasing delay with optional cap; the growth freezes
    /// once the cap is reached.
    Exponential { min: Duration, base: f64, max: Option<Duration>, jitter: Jitter },
    /// Fibonacci schedule seeded with the pair `(min, min + factor)`.
    Fibonacci { min: Duration, factor: Duration, max: Option<Duration>, jitter: Jitter },
    /// AWS-style decorrelated exponential backoff with built-in jitter: each
    /// delay is drawn uniformly from `[min, min(max, previous * multiplier)]`.
    DecorrelatedExponential { min: Duration, max: Duration, multiplier: f64 },
    /// Polly-style soft exponential backoff with built-in jitter, tuned so the
    /// median of the emitted delays tracks `median`.
    SoftExponential { median: Duration, max: Option<Duration>, pfactor: f64, scaling: f64 },
}

impl Backoff {
    /// Create a constant backoff schedule.
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay, jitter: Jitter::None }
    }

    /// Create a schedule that cycles through the given delays.
    pub fn intervals(delays: Vec<Duration>) -> Self {
        Backoff::Intervals { delays, jitter: Jitter::None }
    }

    /// Create a linear backoff schedule (`min + n * additive`).
    pub fn linear(min: Duration, additive: Duration) -> Self {
        Backoff::Linear { min, additive, max: None, jitter: Jitter::None }
    }

    /// Create an exponential backoff schedule (`min * 2^n`).
    pub fn exponential(min: Duration) -> Self {
        Backoff::Exponential { min, base: 2.0, max: None, jitter: Jitter::None }
    }

    /// Create a Fibonacci backoff schedule seeded with `(min, min + factor)`.
    pub fn fibonacci(min: Duration, factor: Duration) -> Self {
        Backoff::Fibonacci { min, factor, max: None, jitter: Jitter::None }
    }

    /// Create a decorrelated exponential schedule bounded by `[min, max]`.
    pub fn decorrelated_exponential(min: Duration, max: Duration) -> Self {
        Backoff::DecorrelatedExponential { min, max, multiplier: 3.0 }
    }

    /// Create a soft exponential schedule around the given median delay.
    pub fn soft_exponential(median: Duration) -> Self {
        Backoff::SoftExponential { median, max: None, pfactor: 4.0, scaling: 1.0 / 1.4 }
    }

    /// Cap the emitted delays. Ignored by schedules without a cap parameter.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match &mut self {
            Backoff::Linear { max, .. }
            | Backoff::Exponential { max, .. }
            | Backoff::Fibonacci { max, .. }
            | Backoff::SoftExponential { max, .. } => *max = Some(cap),
            Backoff::DecorrelatedExponential { max, .. } => *max = cap,
            _ => {}
        }
        self
    }

    /// Attach a jitter strategy. Ignored by schedules with built-in jitter.
    pub fn with_jitter(mut self, j: Jitter) -> Self {
        match &mut self {
            Backoff::Constant { jitter, .. }
            | Backoff::Intervals { jitter, .. }
            | Backoff::Linear { jitter, .. }
            | Backoff::Exponential { jitter, .. }
            | Backoff::Fibonacci { jitter, .. } => *jitter = j,
            _ => {}
        }
        self
    }

    /// Override the exponential base. Ignored by other schedules.
    pub fn with_base(mut self, b: f64) -> Self {
        if let Backoff::Exponential { base, .. } = &mut self {
            *base = b;
        }
        self
    }

    /// Override the decorrelation multiplier. Ignored by other schedules.
    pub fn with_multiplier(mut self, m: f64) -> Self {
        if let Backoff::DecorrelatedExponential { multiplier, .. } = &mut self {
            *multiplier = m;
        }
        self
    }

    /// Validate the schedule parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Backoff::Intervals { delays, .. } if delays.is_empty() => {
                Err(ConfigError::EmptyIntervals)
            }
            Backoff::Exponential { base, .. } if *base <= 0.0 => {
                Err(ConfigError::NonPositive { name: "base" })
            }
            Backoff::DecorrelatedExponential { multiplier, .. } if *multiplier <= 0.0 => {
                Err(ConfigError::NonPositive { name: "multiplier" })
            }
            Backoff::SoftExponential { pfactor, .. } if *pfactor <= 0.0 => {
                Err(ConfigError::NonPositive { name: "pfactor" })
            }
            Backoff::SoftExponential { scaling, .. } if *scaling <= 0.0 => {
                Err(ConfigError::NonPositive { name: "scaling" })
            }
            _ => Ok(()),
        }
    }

    /// Build a fresh, rewound sequence for this schedule.
    pub fn sequence(&self) -> Box<dyn DelaySequence> {
        match self.clone() {
            Backoff::Constant { delay, jitter } => {
                Box::new(ConstantSequence { delay_millis: as_millis(delay), jitter })
            }
            Backoff::Intervals { delays, jitter } => Box::new(IntervalSequence {
                delays_millis: delays.iter().copied().map(as_millis).collect(),
                jitter,
                position: 0,
            }),
            Backoff::Linear { min, additive, max, jitter } => Box::new(LinearSequence {
                min_millis: as_millis(min),
                additive_millis: as_millis(additive),
                max_millis: max.map(as_millis),
                jitter,
                attempt: 0,
            }),
            Backoff::Exponential { min, base, max, jitter } => Box::new(ExponentialSequence {
                min_millis: as_millis(min),
                base,
                max_millis: max.map(as_millis),
                jitter,
                attempt: 0,
            }),
            Backoff::Fibonacci { min, factor, max, jitter } => {
                let min_millis = as_millis(min);
                let second = min_millis + as_millis(factor);
                Box::new(FibonacciSequence {
                    min_millis,
                    second_millis: second,
                    max_millis: max.map(as_millis),
                    jitter,
                    current: min_millis,
                    next: second,
                })
            }
            Backoff::DecorrelatedExponential { min, max, multiplier } => {
                let min_millis = as_millis(min);
                Box::new(DecorrelatedSequence {
                    min_millis,
                    max_millis: as_millis(max),
                    multiplier,
                    current: min_millis,
                })
            }
            Backoff::SoftExponential { median, max, pfactor, scaling } => {
                Box::new(SoftExponentialSequence {
                    median_millis: as_millis(median),
                    max_millis: max.map(as_millis),
                    pfactor,
                    scaling,
                    attempt: 0,
                })
            }
        }
    }
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Clamp to the configured cap and the global ceiling, then emit.
fn emit(millis: f64, max_millis: Option<f64>) -> Duration {
    let capped = millis
        .min(max_millis.unwrap_or(f64::INFINITY))
        .min(MAX_BACKOFF_MILLIS)
        .max(0.0);
    Duration::from_secs_f64(capped / 1000.0)
}

struct ConstantSequence {
    delay_millis: f64,
    jitter: Jitter,
}

impl DelaySequence for ConstantSequence {
    fn next_delay(&mut self) -> Duration {
        let jittered = self.jitter.apply_millis(self.delay_millis, &mut rand::rng());
        emit(jittered, None)
    }

    fn reset(&mut self) {}
}

struct IntervalSequence {
    delays_millis: Vec<f64>,
    jitter: Jitter,
    position: usize,
}

impl DelaySequence for IntervalSequence {
    fn next_delay(&mut self) -> Duration {
        let delay = self.delays_millis[self.position % self.delays_millis.len()];
        self.position = self.position.wrapping_add(1);
        emit(self.jitter.apply_millis(delay, &mut rand::rng()), None)
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

struct LinearSequence {
    min_millis: f64,
    additive_millis: f64,
    max_millis: Option<f64>,
    jitter: Jitter,
    attempt: u32,
}

impl DelaySequence for LinearSequence {
    fn next_delay(&mut self) -> Duration {
        let delay = self.min_millis + f64::from(self.attempt) * self.additive_millis;
        self.attempt = self.attempt.saturating_add(1);

        let capped = delay.min(self.max_millis.unwrap_or(f64::INFINITY));
        emit(self.jitter.apply_millis(capped, &mut rand::rng()), self.max_millis)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

struct ExponentialSequence {
    min_millis: f64,
    base: f64,
    max_millis: Option<f64>,
    jitter: Jitter,
    attempt: u32,
}

impl DelaySequence for ExponentialSequence {
    fn next_delay(&mut self) -> Duration {
        let mut delay = self.min_millis * self.base.powf(f64::from(self.attempt));

        match self.max_millis {
            Some(max) if delay > max => delay = max,
            // once delays pass the cap there is no point growing the exponent
            _ => self.attempt = self.attempt.saturating_add(1),
        }

        emit(self.jitter.apply_millis(delay, &mut rand::rng()), self.max_millis)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

struct FibonacciSequence {
    min_millis: f64,
    second_millis: f64,
    max_millis: Option<f64>,
    jitter: Jitter,
    current: f64,
    next: f64,
}

impl DelaySequence for FibonacciSequence {
    fn next_delay(&mut self) -> Duration {
        let cap = self.max_millis.unwrap_or(f64::INFINITY);
        let delay = self.current.min(cap);

        if self.current < cap {
            let sum = self.current + self.next;
            self.current = self.next;
            self.next = sum;
        }

        emit(self.jitter.apply_millis(delay, &mut rand::rng()), self.max_millis)
    }

    fn reset(&mut self) {
        self.current = self.min_millis;
        self.next = self.second_millis;
    }
}

struct DecorrelatedSequence {
    min_millis: f64,
    max_millis: f64,
    multiplier: f64,
    current: f64,
}

impl DelaySequence for DecorrelatedSequence {
    fn next_delay(&mut self) -> Duration {
        let upper = self.max_millis.min(self.current * self.multiplier);

        self.current = if upper <= self.min_millis {
            self.min_millis
        } else {
            rand::rng().random_range(self.min_millis..=upper)
        };

        emit(self.current, Some(self.max_millis))
    }

    fn reset(&mut self) {
        self.current = self.min_millis;
    }
}

struct SoftExponentialSequence {
    median_millis: f64,
    max_millis: Option<f64>,
    pfactor: f64,
    scaling: f64,
    attempt: u32,
}

impl DelaySequence for SoftExponentialSequence {
    fn next_delay(&mut self) -> Duration {
        let t = f64::from(self.attempt) + rand::rng().random_range(0.0..1.0);
        let curve = 2_f64.powf(t) * (self.pfactor * t).sqrt().tanh();
        let delay = curve * self.scaling * self.median_millis;

        self.attempt = self.attempt.saturating_add(1);
        emit(delay, self.max_millis)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(backoff: &Backoff, n: usize) -> Vec<Duration> {
        let mut seq = backoff.sequence();
        (0..n).map(|_| seq.next_delay()).collect()
    }

    #[test]
    fn constant_backoff_returns_same_delay() {
        let delays = take(&Backoff::constant(Duration::from_secs(1)), 5);
        assert!(delays.iter().all(|d| *d == Duration::from_secs(1)));
    }

    #[test]
    fn intervals_cycle_indefinitely() {
        let backoff = Backoff::intervals(vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ]);
        let delays = take(&backoff, 7);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(300));
        assert_eq!(delays[3], Duration::from_millis(100));
        assert_eq!(delays[6], Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_increases_by_additive() {
        let backoff = Backoff::linear(Duration::from_millis(100), Duration::from_millis(50));
        let delays = take(&backoff, 4);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(150));
        assert_eq!(delays[2], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(250));
    }

    #[test]
    fn linear_backoff_respects_max() {
        let backoff = Backoff::linear(Duration::from_millis(100), Duration::from_millis(100))
            .with_max(Duration::from_millis(250));
        let delays = take(&backoff, 4);
        assert_eq!(delays[2], Duration::from_millis(250));
        assert_eq!(delays[3], Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        let delays = take(&backoff, 5);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_millis(1600));
    }

    #[test]
    fn exponential_backoff_caps_and_freezes() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1));
        let mut seq = backoff.sequence();
        for _ in 0..10 {
            seq.next_delay();
        }
        assert_eq!(seq.next_delay(), Duration::from_secs(1));
        assert_eq!(seq.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn exponential_base_is_configurable() {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_base(3.0);
        let delays = take(&backoff, 3);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(300));
        assert_eq!(delays[2], Duration::from_millis(900));
    }

    #[test]
    fn exponential_never_exceeds_the_global_ceiling() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        let mut seq = backoff.sequence();
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            last = seq.next_delay();
            assert!(last <= MAX_BACKOFF);
        }
        assert_eq!(last, MAX_BACKOFF);
    }

    #[test]
    fn fibonacci_backoff_follows_the_sequence() {
        let backoff = Backoff::fibonacci(Duration::from_millis(100), Duration::from_millis(100));
        let delays = take(&backoff, 5);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(300));
        assert_eq!(delays[3], Duration::from_millis(500));
        assert_eq!(delays[4], Duration::from_millis(800));
    }

    #[test]
    fn fibonacci_backoff_clamps_at_max() {
        let backoff = Backoff::fibonacci(Duration::from_millis(100), Duration::from_millis(100))
            .with_max(Duration::from_millis(400));
        let delays = take(&backoff, 6);
        assert_eq!(delays[2], Duration::from_millis(300));
        assert_eq!(delays[3], Duration::from_millis(400));
        assert_eq!(delays[5], Duration::from_millis(400));
    }

    #[test]
    fn deterministic_backoffs_are_non_decreasing() {
        for backoff in [
            Backoff::linear(Duration::from_millis(10), Duration::from_millis(5)),
            Backoff::exponential(Duration::from_millis(10)).with_max(Duration::from_secs(5)),
            Backoff::fibonacci(Duration::from_millis(10), Duration::from_millis(5))
                .with_max(Duration::from_secs(5)),
        ] {
            let delays = take(&backoff, 20);
            for pair in delays.windows(2) {
                assert!(pair[0] <= pair[1], "sequence decreased: {:?}", delays);
            }
        }
    }

    #[test]
    fn decorrelated_exponential_stays_within_bounds() {
        let backoff = Backoff::decorrelated_exponential(
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let mut seq = backoff.sequence();
        for _ in 0..200 {
            let delay = seq.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn soft_exponential_grows_and_respects_cap() {
        let backoff = Backoff::soft_exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(10));
        let mut seq = backoff.sequence();

        let first = seq.next_delay();
        assert!(first <= Duration::from_secs(10));

        let mut capped = Duration::ZERO;
        for _ in 0..50 {
            capped = seq.next_delay();
            assert!(capped <= Duration::from_secs(10));
        }
        // far into the schedule the cap dominates
        assert_eq!(capped, Duration::from_secs(10));
    }

    #[test]
    fn reset_rewinds_the_schedule() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        let mut seq = backoff.sequence();
        assert_eq!(seq.next_delay(), Duration::from_millis(100));
        assert_eq!(seq.next_delay(), Duration::from_millis(200));

        seq.reset();
        assert_eq!(seq.next_delay(), Duration::from_millis(100));

        let backoff = Backoff::intervals(vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
        ]);
        let mut seq = backoff.sequence();
        seq.next_delay();
        seq.reset();
        assert_eq!(seq.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn with_max_only_affects_capped_schedules() {
        let constant = Backoff::constant(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(constant.sequence().next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn jittered_schedules_stay_under_the_raw_delay() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .with_jitter(Jitter::Full);
        let mut seq = backoff.sequence();
        for _ in 0..50 {
            assert!(seq.next_delay() <= Duration::from_secs(1));
        }
    }

    #[test]
    fn empty_intervals_fail_validation() {
        assert_eq!(Backoff::intervals(Vec::new()).validate(), Err(ConfigError::EmptyIntervals));
        assert!(Backoff::intervals(vec![Duration::ZERO]).validate().is_ok());
    }

    #[test]
    fn non_positive_parameters_fail_validation() {
        let bad_base = Backoff::exponential(Duration::from_millis(10)).with_base(0.0);
        assert!(bad_base.validate().is_err());

        let bad_multiplier =
            Backoff::decorrelated_exponential(Duration::from_millis(10), Duration::from_secs(1))
                .with_multiplier(0.0);
        assert!(bad_multiplier.validate().is_err());
    }
}
