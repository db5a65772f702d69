//! Circuit breaker with a three-state machine driven by consecutive outcomes.
//!
//! States: working (calls flow), failing (calls rejected until the recovery
//! window elapses), recovering (calls flow while consecutive successes are
//! counted back up). Transitions use lock-free compare-exchange so one breaker
//! can be shared by many concurrent call sites.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{BreakerFailing, ConfigError, PolicyError};
use crate::events::{derive_name, EventDispatcher, EventTracker, ListenerRegistry};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const STATE_WORKING: u8 = 0;
const STATE_FAILING: u8 = 1;
const STATE_RECOVERING: u8 = 2;

/// Snapshot of a breaker's state, as seen by callers and listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through; counts consecutive failures.
    Working { consecutive_failures: usize },
    /// Calls are rejected until the recovery window elapses.
    Failing { remaining: Duration },
    /// Trial period: calls flow while consecutive successes are counted.
    Recovering { consecutive_successes: usize },
}

impl BreakerState {
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working { .. })
    }

    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Failing { .. })
    }

    pub fn is_recovering(&self) -> bool {
        matches!(self, Self::Recovering { .. })
    }
}

/// Context handed to breaker listeners.
#[derive(Debug, Clone)]
pub struct BreakerContext {
    name: Arc<str>,
}

impl BreakerContext {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Listener for breaker lifecycle events. Implement only the events you care
/// about; the rest default to no-ops.
#[async_trait]
pub trait BreakerListener: Send + Sync {
    /// The breaker recovered and is working again.
    async fn on_working(&self, _breaker: BreakerContext, _from: BreakerState, _to: BreakerState) {}

    /// The recovery window elapsed and the breaker is probing the downstream.
    async fn on_recovering(
        &self,
        _breaker: BreakerContext,
        _from: BreakerState,
        _to: BreakerState,
    ) {
    }

    /// The failure threshold was crossed (or a probe failed) and calls are now
    /// rejected.
    async fn on_failing(&self, _breaker: BreakerContext, _from: BreakerState, _to: BreakerState) {}

    /// An admitted call completed successfully.
    async fn on_success(&self, _breaker: BreakerContext, _state: BreakerState) {}
}

/// Process-wide listener registry shared by every circuit breaker.
pub fn breaker_listeners() -> &'static ListenerRegistry<BreakerContext, dyn BreakerListener> {
    static REGISTRY: OnceLock<ListenerRegistry<BreakerContext, dyn BreakerListener>> =
        OnceLock::new();
    REGISTRY.get_or_init(ListenerRegistry::new)
}

struct BreakerShared {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    failing_since: AtomicU64,
    failing_until: AtomicU64,
}

/// Short-circuits calls to a downstream whose consecutive failures crossed the
/// configured threshold.
pub struct CircuitBreakerPolicy<E> {
    shared: Arc<BreakerShared>,
    failure_threshold: usize,
    recovery_time: Duration,
    recovery_threshold: usize,
    should_trip: Arc<dyn Fn(&PolicyError<E>) -> bool + Send + Sync>,
    clock: Arc<dyn Clock>,
    context: BreakerContext,
    events: Arc<EventDispatcher<BreakerContext, dyn BreakerListener>>,
}

impl<E> Clone for CircuitBreakerPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            failure_threshold: self.failure_threshold,
            recovery_time: self.recovery_time,
            recovery_threshold: self.recovery_threshold,
            should_trip: Arc::clone(&self.should_trip),
            clock: Arc::clone(&self.clock),
            context: self.context.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<E> std::fmt::Debug for CircuitBreakerPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("name", &self.context.name())
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_time", &self.recovery_time)
            .field("recovery_threshold", &self.recovery_threshold)
            .field("state", &self.state())
            .finish()
    }
}

impl<E> CircuitBreakerPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> CircuitBreakerBuilder<E> {
        CircuitBreakerBuilder::new()
    }

    /// Breaker that trips after `failure_threshold` consecutive failures and
    /// rejects calls for `recovery_time` before probing again.
    pub fn new(failure_threshold: usize, recovery_time: Duration) -> Result<Self, ConfigError> {
        Self::builder()
            .failure_threshold(failure_threshold)
            .recovery_time(recovery_time)
            .build()
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Current state snapshot.
    pub fn state(&self) -> BreakerState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_WORKING => BreakerState::Working {
                consecutive_failures: self.shared.consecutive_failures.load(Ordering::Acquire),
            },
            STATE_FAILING => {
                let until = self.shared.failing_until.load(Ordering::Acquire);
                let now = self.clock.now_millis();
                BreakerState::Failing {
                    remaining: Duration::from_millis(until.saturating_sub(now)),
                }
            }
            STATE_RECOVERING => BreakerState::Recovering {
                consecutive_successes: self.shared.consecutive_successes.load(Ordering::Acquire),
            },
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    /// Run one operation behind the breaker.
    ///
    /// The downstream error is always re-raised; the breaker only adds its own
    /// [`BreakerFailing`] rejection while the failing window is active. Errors
    /// not matching the trip predicate count as successes.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.admit()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(error) => {
                if (self.should_trip)(error) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
            }
        }

        result
    }

    /// Scoped form: run the entry transition and hand back a guard that must
    /// be released with the outcome.
    pub fn acquire(&self) -> Result<BreakerGuard<'_, E>, BreakerFailing> {
        self.admit()?;
        Ok(BreakerGuard { breaker: self })
    }

    /// Entry transition: reject while failing, move to recovering once the
    /// window has elapsed.
    fn admit(&self) -> Result<(), BreakerFailing> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_WORKING | STATE_RECOVERING => return Ok(()),
                STATE_FAILING => {
                    let until = self.shared.failing_until.load(Ordering::Acquire);
                    let now = self.clock.now_millis();

                    if now < until {
                        return Err(BreakerFailing {
                            remaining: Duration::from_millis(until - now),
                        });
                    }

                    match self.shared.state.compare_exchange(
                        STATE_FAILING,
                        STATE_RECOVERING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.shared.consecutive_successes.store(0, Ordering::Release);
                            tracing::info!(breaker = self.context.name(), "breaker recovering");
                            self.publish_recovering(
                                BreakerState::Failing { remaining: Duration::ZERO },
                                BreakerState::Recovering { consecutive_successes: 0 },
                            );
                            return Ok(());
                        }
                        // Someone else transitioned first; re-evaluate.
                        Err(_) => continue,
                    }
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    fn record_success(&self) {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_WORKING => {
                self.shared.consecutive_failures.store(0, Ordering::Release);
                self.publish_success(BreakerState::Working { consecutive_failures: 0 });
            }
            STATE_RECOVERING => {
                let successes =
                    self.shared.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                self.publish_success(BreakerState::Recovering {
                    consecutive_successes: successes,
                });

                if successes >= self.recovery_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_RECOVERING,
                            STATE_WORKING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    tracing::info!(breaker = self.context.name(), "breaker working");
                    self.publish_working(
                        BreakerState::Recovering { consecutive_successes: successes },
                        BreakerState::Working { consecutive_failures: 0 },
                    );
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_WORKING => {
                let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

                if failures >= self.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_WORKING,
                            STATE_FAILING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.start_failing_window();
                    tracing::error!(
                        breaker = self.context.name(),
                        failures,
                        threshold = self.failure_threshold,
                        "breaker failing"
                    );
                    self.publish_failing(
                        BreakerState::Working { consecutive_failures: failures },
                        BreakerState::Failing { remaining: self.recovery_time },
                    );
                }
            }
            STATE_RECOVERING => {
                let successes = self.shared.consecutive_successes.load(Ordering::Acquire);
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_RECOVERING,
                        STATE_FAILING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.start_failing_window();
                    tracing::warn!(breaker = self.context.name(), "recovery probe failed");
                    self.publish_failing(
                        BreakerState::Recovering { consecutive_successes: successes },
                        BreakerState::Failing { remaining: self.recovery_time },
                    );
                }
            }
            _ => {}
        }
    }

    fn start_failing_window(&self) {
        let now = self.clock.now_millis();
        let until = now.saturating_add(self.recovery_time.as_millis() as u64);
        self.shared.failing_since.store(now, Ordering::Release);
        self.shared.failing_until.store(until, Ordering::Release);
    }

    fn publish_working(&self, from: BreakerState, to: BreakerState) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let breaker = context.clone();
            async move { listener.on_working(breaker, from, to).await }
        });
    }

    fn publish_recovering(&self, from: BreakerState, to: BreakerState) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let breaker = context.clone();
            async move { listener.on_recovering(breaker, from, to).await }
        });
    }

    fn publish_failing(&self, from: BreakerState, to: BreakerState) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let breaker = context.clone();
            async move { listener.on_failing(breaker, from, to).await }
        });
    }

    fn publish_success(&self, state: BreakerState) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let breaker = context.clone();
            async move { listener.on_success(breaker, state).await }
        });
    }
}

/// Scoped breaker guard returned by [`CircuitBreakerPolicy::acquire`].
///
/// Dropping the guard without releasing records nothing; call
/// [`BreakerGuard::release`] with the outcome of the guarded region.
#[must_use = "release the guard with the outcome of the guarded region"]
pub struct BreakerGuard<'a, E> {
    breaker: &'a CircuitBreakerPolicy<E>,
}

impl<E> std::fmt::Debug for BreakerGuard<'_, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerGuard")
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl<E> BreakerGuard<'_, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Release with the region's outcome. Errors not matching the breaker's
    /// trip predicate are treated as successes.
    pub fn release(self, outcome: Option<&PolicyError<E>>) {
        match outcome {
            None => self.breaker.record_success(),
            Some(error) if (self.breaker.should_trip)(error) => self.breaker.record_failure(),
            Some(_) => self.breaker.record_success(),
        }
    }
}

pub struct CircuitBreakerBuilder<E> {
    failure_threshold: usize,
    recovery_time: Duration,
    recovery_threshold: usize,
    should_trip: Arc<dyn Fn(&PolicyError<E>) -> bool + Send + Sync>,
    clock: Arc<dyn Clock>,
    name: Option<Arc<str>>,
    listeners: Vec<Arc<dyn BreakerListener>>,
    registry: Option<ListenerRegistry<BreakerContext, dyn BreakerListener>>,
    tracker: Option<EventTracker>,
}

impl<E> CircuitBreakerBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(30),
            recovery_threshold: 1,
            should_trip: Arc::new(|_| true),
            clock: Arc::new(MonotonicClock::default()),
            name: None,
            listeners: Vec::new(),
            registry: Some(breaker_listeners().clone()),
            tracker: None,
        }
    }

    /// Consecutive failures that flip the breaker into its failing state.
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// How long calls are rejected before the breaker probes again.
    pub fn recovery_time(mut self, recovery_time: Duration) -> Self {
        self.recovery_time = recovery_time;
        self
    }

    /// Consecutive probe successes required to close the breaker again.
    pub fn recovery_threshold(mut self, threshold: usize) -> Self {
        self.recovery_threshold = threshold;
        self
    }

    /// Only errors matching `predicate` advance the failure count; anything
    /// else is treated as a success.
    pub fn trip_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.should_trip = Arc::new(predicate);
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<BreakerContext, dyn BreakerListener>>,
    ) -> Self {
        self.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerPolicy<E>, ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::NonPositive { name: "failure_threshold" });
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigError::NonPositive { name: "recovery_threshold" });
        }
        if self.recovery_time.is_zero() {
            return Err(ConfigError::NonPositive { name: "recovery_time" });
        }

        let context =
            BreakerContext { name: self.name.unwrap_or_else(|| derive_name("breaker")) };
        let events = Arc::new(EventDispatcher::new(
            context.clone(),
            self.listeners,
            self.registry,
            self.tracker,
        ));

        Ok(CircuitBreakerPolicy {
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(STATE_WORKING),
                consecutive_failures: AtomicUsize::new(0),
                consecutive_successes: AtomicUsize::new(0),
                failing_since: AtomicU64::new(0),
                failing_until: AtomicU64::new(0),
            }),
            failure_threshold: self.failure_threshold,
            recovery_time: self.recovery_time,
            recovery_threshold: self.recovery_threshold,
            should_trip: self.should_trip,
            clock: self.clock,
            context,
            events,
        })
    }
}

impl<E> Default for CircuitBreakerBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
