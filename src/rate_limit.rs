//! Rate limiting: bucket cores and the limiter policies built on them.
//!
//! [`TokenBucket`] and [`LeakyBucket`] are the synchronous cores; the limiter
//! policies wrap one behind a mutex, add listener dispatch, and expose the
//! guard form ([`RateLimiter::acquire`]) and wrapper form (`execute`). Bucket
//! operations never suspend; only event dispatch leaves the lock.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{BucketError, ConfigError, PolicyError};
use crate::events::{derive_name, EventDispatcher, EventTracker, ListenerRegistry};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Token bucket: replenishes fractional tokens as time passes, allowing bursts
/// up to the bucket size while enforcing the average rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    bucket_size: f64,
    token_per_secs: f64,
    clock: Arc<dyn Clock>,
    tokens: f64,
    next_replenish_at: f64,
}

impl TokenBucket {
    /// Allow `max_executions` per `per_time`, bursting up to `max_executions`.
    pub fn new(max_executions: f64, per_time: Duration) -> Result<Self, ConfigError> {
        if max_executions <= 0.0 {
            return Err(ConfigError::NonPositive { name: "max_executions" });
        }
        if per_time.is_zero() {
            return Err(ConfigError::NonPositive { name: "per_time" });
        }

        let token_per_secs = per_time.as_secs_f64() / max_executions;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis() as f64 / 1000.0;

        Ok(Self {
            bucket_size: max_executions,
            token_per_secs,
            clock,
            tokens: max_executions,
            next_replenish_at: now + token_per_secs,
        })
    }

    /// Override the burst capacity (defaults to `max_executions`).
    pub fn with_bucket_size(mut self, bucket_size: f64) -> Result<Self, ConfigError> {
        if bucket_size <= 0.0 {
            return Err(ConfigError::NonPositive { name: "bucket_size" });
        }
        self.bucket_size = bucket_size;
        self.tokens = bucket_size;
        Ok(self)
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        let now = self.now_secs();
        self.next_replenish_at = now + self.token_per_secs;
        self
    }

    /// Take one token, or fail with [`BucketError::EmptyBucket`].
    pub fn take(&mut self) -> Result<(), BucketError> {
        self.replenish();

        if self.tokens > 0.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(BucketError::EmptyBucket)
        }
    }

    /// Tokens currently available, replenishing first.
    pub fn tokens(&mut self) -> f64 {
        self.replenish();
        self.tokens
    }

    pub fn is_empty(&mut self) -> bool {
        self.tokens() <= 0.0
    }

    fn replenish(&mut self) {
        let now = self.now_secs();
        let until_next = self.next_replenish_at - now;

        if until_next > 0.0 {
            return;
        }

        // The leading 1.0 guarantees the caller that triggered replenishment
        // sees at least one token.
        let tokens_to_add = (1.0 + until_next.abs() / self.token_per_secs).min(self.bucket_size);

        self.tokens = tokens_to_add;
        self.next_replenish_at = (self.next_replenish_at + tokens_to_add * self.token_per_secs)
            .max(now + self.token_per_secs);
    }

    fn now_secs(&self) -> f64 {
        self.clock.now_millis() as f64 / 1000.0
    }
}

/// Leaky bucket: in-flight credits drain at a constant rate; admission fails
/// once the bucket would overflow.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    max_executions: f64,
    rate: f64,
    clock: Arc<dyn Clock>,
    tokens: f64,
    last_checked_at: f64,
}

impl LeakyBucket {
    /// Admit at most `max_executions` within any `per_time` window.
    pub fn new(max_executions: f64, per_time: Duration) -> Result<Self, ConfigError> {
        if max_executions <= 0.0 {
            return Err(ConfigError::NonPositive { name: "max_executions" });
        }
        if per_time.is_zero() {
            return Err(ConfigError::NonPositive { name: "per_time" });
        }

        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis() as f64 / 1000.0;

        Ok(Self {
            max_executions,
            rate: max_executions / per_time.as_secs_f64(),
            clock,
            tokens: 0.0,
            last_checked_at: now,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.last_checked_at = self.now_secs();
        self
    }

    /// Add one credit, or fail with [`BucketError::FilledBucket`].
    pub fn fill(&mut self) -> Result<(), BucketError> {
        self.leak();

        if self.tokens + 1.0 <= self.max_executions {
            self.tokens += 1.0;
            Ok(())
        } else {
            Err(BucketError::FilledBucket)
        }
    }

    /// Credits currently held, leaking first.
    pub fn tokens(&mut self) -> f64 {
        self.leak();
        self.tokens
    }

    pub fn is_full(&mut self) -> bool {
        self.leak();
        self.tokens.ceil() >= self.max_executions
    }

    fn leak(&mut self) {
        let now = self.now_secs();
        let elapsed = now - self.last_checked_at;
        self.tokens = (self.tokens - elapsed * self.rate).max(0.0);
        self.last_checked_at = now;
    }

    fn now_secs(&self) -> f64 {
        self.clock.now_millis() as f64 / 1000.0
    }
}

/// Context handed to rate-limit listeners.
#[derive(Debug, Clone)]
pub struct RateLimitContext {
    name: Arc<str>,
}

impl RateLimitContext {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Listener for rate-limiter lifecycle events. Implement only the events you
/// care about; the rest default to no-ops.
#[async_trait]
pub trait RateLimitListener: Send + Sync {
    async fn on_rate_limited(&self, _limiter: RateLimitContext) {}
}

/// Process-wide listener registry shared by every rate limiter.
pub fn rate_limit_listeners() -> &'static ListenerRegistry<RateLimitContext, dyn RateLimitListener>
{
    static REGISTRY: OnceLock<ListenerRegistry<RateLimitContext, dyn RateLimitListener>> =
        OnceLock::new();
    REGISTRY.get_or_init(ListenerRegistry::new)
}

/// Admission interface shared by the limiter policies, and the hook the retry
/// engine uses to cap its retry rate.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempt to take one execution slot right now.
    async fn acquire(&self) -> Result<(), BucketError>;
}

/// Token-bucket rate limiter policy.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    context: RateLimitContext,
    events: Arc<EventDispatcher<RateLimitContext, dyn RateLimitListener>>,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("name", &self.context.name())
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl TokenBucketLimiter {
    pub fn builder(max_executions: f64, per_time: Duration) -> TokenBucketLimiterBuilder {
        TokenBucketLimiterBuilder {
            max_executions,
            per_time,
            bucket_size: None,
            common: LimiterCommon::new(),
        }
    }

    pub fn new(max_executions: f64, per_time: Duration) -> Result<Self, ConfigError> {
        Self::builder(max_executions, per_time).build()
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Tokens currently available, replenishing first.
    pub fn tokens(&self) -> f64 {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).tokens()
    }

    /// Run one operation behind the limiter. The operation is never invoked
    /// when admission is denied.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.acquire().await?;
        operation().await
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self) -> Result<(), BucketError> {
        let outcome = {
            let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            bucket.take()
        };

        if outcome.is_err() {
            publish_rate_limited(&self.context, &self.events);
        }

        outcome
    }
}

/// Leaky-bucket rate limiter policy.
#[derive(Clone)]
pub struct LeakyBucketLimiter {
    bucket: Arc<Mutex<LeakyBucket>>,
    context: RateLimitContext,
    events: Arc<EventDispatcher<RateLimitContext, dyn RateLimitListener>>,
}

impl std::fmt::Debug for LeakyBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucketLimiter")
            .field("name", &self.context.name())
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl LeakyBucketLimiter {
    pub fn builder(max_executions: f64, per_time: Duration) -> LeakyBucketLimiterBuilder {
        LeakyBucketLimiterBuilder { max_executions, per_time, common: LimiterCommon::new() }
    }

    pub fn new(max_executions: f64, per_time: Duration) -> Result<Self, ConfigError> {
        Self::builder(max_executions, per_time).build()
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Credits currently held, leaking first.
    pub fn tokens(&self) -> f64 {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).tokens()
    }

    /// Run one operation behind the limiter. The operation is never invoked
    /// when admission is denied.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.acquire().await?;
        operation().await
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    async fn acquire(&self) -> Result<(), BucketError> {
        let outcome = {
            let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            bucket.fill()
        };

        if outcome.is_err() {
            publish_rate_limited(&self.context, &self.events);
        }

        outcome
    }
}

fn publish_rate_limited(
    context: &RateLimitContext,
    events: &EventDispatcher<RateLimitContext, dyn RateLimitListener>,
) {
    tracing::debug!(limiter = context.name(), "rate limit exceeded");
    let context = context.clone();
    events.publish(move |listener| {
        let limiter = context.clone();
        async move { listener.on_rate_limited(limiter).await }
    });
}

/// Listener wiring shared by both limiter builders.
struct LimiterCommon {
    clock: Option<Arc<dyn Clock>>,
    name: Option<Arc<str>>,
    listeners: Vec<Arc<dyn RateLimitListener>>,
    registry: Option<ListenerRegistry<RateLimitContext, dyn RateLimitListener>>,
    tracker: Option<EventTracker>,
}

impl LimiterCommon {
    fn new() -> Self {
        Self {
            clock: None,
            name: None,
            listeners: Vec::new(),
            registry: Some(rate_limit_listeners().clone()),
            tracker: None,
        }
    }

    fn finish(
        self,
    ) -> (RateLimitContext, Arc<EventDispatcher<RateLimitContext, dyn RateLimitListener>>) {
        let context = RateLimitContext {
            name: self.name.unwrap_or_else(|| derive_name("ratelimiter")),
        };
        let events = Arc::new(EventDispatcher::new(
            context.clone(),
            self.listeners,
            self.registry,
            self.tracker,
        ));
        (context, events)
    }
}

pub struct TokenBucketLimiterBuilder {
    max_executions: f64,
    per_time: Duration,
    bucket_size: Option<f64>,
    common: LimiterCommon,
}

impl TokenBucketLimiterBuilder {
    /// Override the burst capacity (defaults to `max_executions`).
    pub fn bucket_size(mut self, bucket_size: f64) -> Self {
        self.bucket_size = Some(bucket_size);
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.common.clock = Some(Arc::new(clock));
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.common.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RateLimitListener>) -> Self {
        self.common.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<RateLimitContext, dyn RateLimitListener>>,
    ) -> Self {
        self.common.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.common.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<TokenBucketLimiter, ConfigError> {
        let mut bucket = TokenBucket::new(self.max_executions, self.per_time)?;
        if let Some(size) = self.bucket_size {
            bucket = bucket.with_bucket_size(size)?;
        }
        if let Some(clock) = &self.common.clock {
            bucket = bucket.with_clock(SharedClock(Arc::clone(clock)));
        }

        let (context, events) = self.common.finish();
        Ok(TokenBucketLimiter { bucket: Arc::new(Mutex::new(bucket)), context, events })
    }
}

pub struct LeakyBucketLimiterBuilder {
    max_executions: f64,
    per_time: Duration,
    common: LimiterCommon,
}

impl LeakyBucketLimiterBuilder {
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.common.clock = Some(Arc::new(clock));
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.common.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RateLimitListener>) -> Self {
        self.common.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<RateLimitContext, dyn RateLimitListener>>,
    ) -> Self {
        self.common.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.common.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<LeakyBucketLimiter, ConfigError> {
        let mut bucket = LeakyBucket::new(self.max_executions, self.per_time)?;
        if let Some(clock) = &self.common.clock {
            bucket = bucket.with_clock(SharedClock(Arc::clone(clock)));
        }

        let (context, events) = self.common.finish();
        Ok(LeakyBucketLimiter { bucket: Arc::new(Mutex::new(bucket)), context, events })
    }
}

/// Adapter so an already-shared clock handle can be re-used by a bucket.
#[derive(Debug, Clone)]
struct SharedClock(Arc<dyn Clock>);

impl Clock for SharedClock {
    fn now_millis(&self) -> u64 {
        self.0.now_millis()
    }
}
