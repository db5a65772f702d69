//! Retry policy: loops an operation with backoff while failures match, with an
//! optional rate cap shared across invocations.

use crate::backoff::Backoff;
use crate::error::{ConfigError, PolicyError, SharedError, MAX_RETRY_FAILURES};
use crate::events::{derive_name, EventDispatcher, EventTracker, ListenerRegistry};
use crate::rate_limit::RateLimiter;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Retry budget: a number of retries after the initial call, or no bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// Retry up to `n` times after the initial call, so the operation runs at
    /// most `n + 1` times.
    Bounded(usize),
    /// Retry until the operation succeeds.
    Unbounded,
}

/// Counts failed attempts against the configured budget.
#[derive(Debug)]
struct AttemptCounter {
    current: usize,
    limit: Option<usize>,
}

impl AttemptCounter {
    fn new(attempts: Attempts) -> Self {
        let limit = match attempts {
            Attempts::Bounded(n) => Some(n),
            Attempts::Unbounded => None,
        };
        Self { current: 0, limit }
    }

    /// Failed attempts recorded so far.
    fn current(&self) -> usize {
        self.current
    }

    /// Record a failed attempt; true when the budget is now exhausted.
    fn record_failure(&mut self) -> bool {
        self.current += 1;
        match self.limit {
            Some(limit) => self.current > limit,
            None => false,
        }
    }
}

/// Context handed to retry listeners.
#[derive(Debug, Clone)]
pub struct RetryContext {
    name: Arc<str>,
}

impl RetryContext {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Listener for retry lifecycle events. Implement only the events you care
/// about; the rest default to no-ops.
#[async_trait]
pub trait RetryListener: Send + Sync {
    /// A matching failure was recorded and the engine is about to wait
    /// `delay` before retry number `attempt`.
    async fn on_retry(
        &self,
        _retry: RetryContext,
        _error: SharedError,
        _attempt: usize,
        _delay: Duration,
    ) {
    }

    /// The retry budget is exhausted; the caller sees `AttemptsExceeded`.
    async fn on_attempts_exceeded(&self, _retry: RetryContext) {}

    /// The operation succeeded after `attempts` invocations.
    async fn on_success(&self, _retry: RetryContext, _attempts: usize) {}
}

/// Process-wide listener registry shared by every retry policy.
pub fn retry_listeners() -> &'static ListenerRegistry<RetryContext, dyn RetryListener> {
    static REGISTRY: OnceLock<ListenerRegistry<RetryContext, dyn RetryListener>> = OnceLock::new();
    REGISTRY.get_or_init(ListenerRegistry::new)
}

/// Retries an operation while its failures match the configured predicate,
/// sleeping out the backoff schedule between attempts.
pub struct RetryPolicy<E> {
    attempts: Attempts,
    backoff: Backoff,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    limiter: Option<Arc<dyn RateLimiter>>,
    sleeper: Arc<dyn Sleeper>,
    context: RetryContext,
    events: Arc<EventDispatcher<RetryContext, dyn RetryListener>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            attempts: self.attempts,
            backoff: self.backoff.clone(),
            should_retry: Arc::clone(&self.should_retry),
            limiter: self.limiter.clone(),
            sleeper: Arc::clone(&self.sleeper),
            context: self.context.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.context.name())
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Invoke `operation` until it succeeds, a failure doesn't match, the
    /// budget runs out, or an attached limiter rejects.
    ///
    /// A limiter rejection is a hard stop: it propagates instead of being
    /// retried, so the loop never spins against its own rate cap.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut counter = AttemptCounter::new(self.attempts);
        let mut backoff = self.backoff.sequence();
        let mut failures: Vec<SharedError> = Vec::new();

        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await?;
            }

            match operation().await {
                Ok(value) => {
                    self.publish_success(counter.current() + 1);
                    return Ok(value);
                }
                Err(PolicyError::Inner(error)) => {
                    if !(self.should_retry)(&error) {
                        return Err(PolicyError::Inner(error));
                    }

                    let shared: SharedError = Arc::new(error);
                    failures.push(Arc::clone(&shared));
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if counter.record_failure() {
                        tracing::warn!(
                            retry = self.context.name(),
                            attempts = counter.current(),
                            "retry budget exhausted"
                        );
                        self.publish_attempts_exceeded();
                        return Err(PolicyError::AttemptsExceeded {
                            attempts: counter.current(),
                            failures,
                        });
                    }

                    let delay = backoff.next_delay();
                    self.publish_retry(shared, counter.current(), delay);
                    self.sleeper.sleep(delay).await;
                }
                // Short-circuit errors from other policies are not retried.
                Err(other) => return Err(other),
            }
        }
    }

    fn publish_retry(&self, error: SharedError, attempt: usize, delay: Duration) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let retry = context.clone();
            let error = Arc::clone(&error);
            async move { listener.on_retry(retry, error, attempt, delay).await }
        });
    }

    fn publish_attempts_exceeded(&self) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let retry = context.clone();
            async move { listener.on_attempts_exceeded(retry).await }
        });
    }

    fn publish_success(&self, attempts: usize) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let retry = context.clone();
            async move { listener.on_success(retry, attempts).await }
        });
    }
}

pub struct RetryPolicyBuilder<E> {
    attempts: Attempts,
    backoff: Backoff,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    limiter: Option<Arc<dyn RateLimiter>>,
    sleeper: Arc<dyn Sleeper>,
    name: Option<Arc<str>>,
    listeners: Vec<Arc<dyn RetryListener>>,
    registry: Option<ListenerRegistry<RetryContext, dyn RetryListener>>,
    tracker: Option<EventTracker>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            attempts: Attempts::Bounded(3),
            backoff: Backoff::constant(Duration::from_millis(500)),
            should_retry: Arc::new(|_| true),
            limiter: None,
            sleeper: Arc::new(TokioSleeper),
            name: None,
            listeners: Vec::new(),
            registry: Some(retry_listeners().clone()),
            tracker: None,
        }
    }

    /// Retry up to `n` times after the initial call.
    pub fn attempts(mut self, n: usize) -> Self {
        self.attempts = Attempts::Bounded(n);
        self
    }

    /// Retry until the operation succeeds.
    pub fn unbounded(mut self) -> Self {
        self.attempts = Attempts::Unbounded;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Only failures matching `predicate` are retried; anything else
    /// propagates immediately.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Cap the attempt rate across every invocation of this policy.
    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<RetryContext, dyn RetryListener>>,
    ) -> Self {
        self.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        if self.attempts == Attempts::Bounded(0) {
            return Err(ConfigError::ZeroAttempts);
        }
        self.backoff.validate()?;

        let context =
            RetryContext { name: self.name.unwrap_or_else(|| derive_name("retry")) };
        let events = Arc::new(EventDispatcher::new(
            context.clone(),
            self.listeners,
            self.registry,
            self.tracker,
        ));

        Ok(RetryPolicy {
            attempts: self.attempts,
            backoff: self.backoff,
            should_retry: self.should_retry,
            limiter: self.limiter,
            sleeper: self.sleeper,
            context,
            events,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
