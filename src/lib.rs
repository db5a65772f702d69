#![forbid(unsafe_code)]

//! # Redoubt
//!
//! Composable fault-tolerance policies for async Rust: retry with pluggable
//! backoff, circuit breaking, rate limiting, bulkheading, timeout enforcement,
//! fallback substitution, and a TTL-aware LRU cache.
//!
//! ## Features
//!
//! - **Retry** with constant, interval, linear, exponential, Fibonacci,
//!   decorrelated and soft exponential backoff, jitter, and an optional
//!   token-bucket cap on the retry rate
//! - **Circuit breakers** with a working / failing / recovering state machine
//! - **Rate limiters** backed by token and leaky buckets
//! - **Bulkheads** bounding concurrency and total admitted work
//! - **Timeouts** with cooperative cancellation
//! - **Fallbacks** triggered by matching errors or rejected results
//! - **Listeners** on every policy, dispatched without blocking the caller
//!
//! Every policy offers a wrapper form (`execute`) and, where entry/exit is
//! meaningful, a scoped-guard form (`acquire` / `bound`). Policies are `Clone`
//! and share their state, so one instance can guard many call sites.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use redoubt::{Backoff, Jitter, PolicyError, RetryPolicy};
//!
//! #[derive(Debug)]
//! struct UpstreamError;
//!
//! impl std::fmt::Display for UpstreamError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "upstream unavailable")
//!     }
//! }
//!
//! impl std::error::Error for UpstreamError {}
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), PolicyError<UpstreamError>> {
//!     let retry = RetryPolicy::builder()
//!         .attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(10)).with_jitter(Jitter::full()))
//!         .build()
//!         .expect("valid retry policy");
//!
//!     let calls = Arc::new(AtomicUsize::new(0));
//!     let calls_in_op = calls.clone();
//!     let answer = retry
//!         .execute(|| {
//!             let calls = calls_in_op.clone();
//!             async move {
//!                 if calls.fetch_add(1, Ordering::Relaxed) < 2 {
//!                     Err(PolicyError::Inner(UpstreamError))
//!                 } else {
//!                     Ok(42)
//!                 }
//!             }
//!         })
//!         .await?;
//!
//!     assert_eq!(answer, 42);
//!     assert_eq!(calls.load(Ordering::Relaxed), 3);
//!     Ok(())
//! }
//! ```

mod backoff;
mod bulkhead;
mod cache;
mod circuit_breaker;
mod clock;
mod error;
mod events;
mod fallback;
mod jitter;
mod rate_limit;
mod retry;
mod sleeper;
mod stack;
mod timeout;

// Re-exports
pub use backoff::{Backoff, DelaySequence, MAX_BACKOFF};
pub use bulkhead::{
    bulkhead_listeners, BulkheadBuilder, BulkheadContext, BulkheadListener, BulkheadPermit,
    BulkheadPolicy,
};
pub use cache::TtlCache;
pub use circuit_breaker::{
    breaker_listeners, BreakerContext, BreakerGuard, BreakerListener, BreakerState,
    CircuitBreakerBuilder, CircuitBreakerPolicy,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{
    BreakerFailing, BucketError, BulkheadFull, ConfigError, PolicyError, SharedError,
    MAX_RETRY_FAILURES,
};
pub use events::{EventTracker, ListenerRegistry};
pub use fallback::{
    fallback_listeners, FallbackBuilder, FallbackCause, FallbackContext, FallbackListener,
    FallbackPolicy, FallbackTrigger,
};
pub use jitter::Jitter;
pub use rate_limit::{
    rate_limit_listeners, LeakyBucket, LeakyBucketLimiter, LeakyBucketLimiterBuilder,
    RateLimitContext, RateLimitListener, RateLimiter, TokenBucket, TokenBucketLimiter,
    TokenBucketLimiterBuilder,
};
pub use retry::{
    retry_listeners, Attempts, RetryContext, RetryListener, RetryPolicy, RetryPolicyBuilder,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{PolicyStack, PolicyStackBuilder};
pub use timeout::{
    timeout_listeners, TimeoutBuilder, TimeoutContext, TimeoutListener, TimeoutPolicy, MAX_TIMEOUT,
};

pub mod prelude;
