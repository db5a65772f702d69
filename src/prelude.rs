//! Convenient re-exports for common Redoubt types.
pub use crate::{
    backoff::{Backoff, DelaySequence, MAX_BACKOFF},
    bulkhead::{BulkheadListener, BulkheadPermit, BulkheadPolicy},
    cache::TtlCache,
    circuit_breaker::{BreakerListener, BreakerState, CircuitBreakerPolicy},
    clock::{Clock, ManualClock, MonotonicClock},
    error::{BucketError, ConfigError, PolicyError, SharedError},
    events::{EventTracker, ListenerRegistry},
    fallback::{FallbackCause, FallbackListener, FallbackPolicy, FallbackTrigger},
    jitter::Jitter,
    rate_limit::{LeakyBucketLimiter, RateLimitListener, RateLimiter, TokenBucketLimiter},
    retry::{Attempts, RetryListener, RetryPolicy},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    stack::{PolicyStack, PolicyStackBuilder},
    timeout::{TimeoutListener, TimeoutPolicy, MAX_TIMEOUT},
};
