//! Error types for fault-tolerance policies.

use std::fmt;
use std::time::Duration;

/// Cap on the number of stored failures inside `AttemptsExceeded` to avoid
/// unbounded growth during long retry loops.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Shared handle to an error, as handed to listeners and kept in failure
/// windows after the typed error has been fanned out.
pub type SharedError = std::sync::Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Rejection raised by a rate-limiter bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BucketError {
    /// The token bucket has no tokens left in the current window.
    #[error("token bucket is empty")]
    EmptyBucket,
    /// The leaky bucket is filled to its limit.
    #[error("leaky bucket is full")]
    FilledBucket,
}

/// The breaker is in its failing window and rejected the call outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker failing for another {remaining:?}")]
pub struct BreakerFailing {
    /// Time left until the breaker starts probing for recovery.
    pub remaining: Duration,
}

/// The bulkhead has no capacity slots left (in-flight plus queued).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bulkhead at capacity ({in_flight} in flight, limit {max_capacity})")]
pub struct BulkheadFull {
    /// Operations currently admitted (running or queued).
    pub in_flight: usize,
    /// Total admission limit.
    pub max_capacity: usize,
}

/// Unified error type surfaced by every policy wrapper.
#[derive(Debug)]
pub enum PolicyError<E> {
    /// All retry attempts were exhausted.
    AttemptsExceeded {
        /// Number of times the operation was invoked.
        attempts: usize,
        /// Window of the most recent matching failures (at most
        /// [`MAX_RETRY_FAILURES`]).
        failures: Vec<SharedError>,
    },
    /// The circuit breaker short-circuited the call.
    BreakerFailing(BreakerFailing),
    /// The bulkhead rejected the call at admission.
    BulkheadFull(BulkheadFull),
    /// A rate limiter denied admission.
    RateLimitExceeded(BucketError),
    /// The operation exceeded its deadline and was cancelled.
    MaxDurationExceeded { elapsed: Duration, limit: Duration },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: Clone> Clone for PolicyError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::AttemptsExceeded { attempts, failures } => {
                Self::AttemptsExceeded { attempts: *attempts, failures: failures.clone() }
            }
            Self::BreakerFailing(e) => Self::BreakerFailing(*e),
            Self::BulkheadFull(e) => Self::BulkheadFull(*e),
            Self::RateLimitExceeded(cause) => Self::RateLimitExceeded(*cause),
            Self::MaxDurationExceeded { elapsed, limit } => {
                Self::MaxDurationExceeded { elapsed: *elapsed, limit: *limit }
            }
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for PolicyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptsExceeded { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "retry gave up after {} attempts, last error: {}", attempts, last)
            }
            Self::BreakerFailing(e) => write!(f, "{}", e),
            Self::BulkheadFull(e) => write!(f, "{}", e),
            Self::RateLimitExceeded(cause) => write!(f, "rate limit exceeded: {}", cause),
            Self::MaxDurationExceeded { elapsed, limit } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, limit)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PolicyError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::AttemptsExceeded { failures, .. } => {
                failures.last().map(|e| e.as_ref() as &dyn std::error::Error)
            }
            Self::RateLimitExceeded(cause) => Some(cause),
            _ => None,
        }
    }
}

impl<E> From<BreakerFailing> for PolicyError<E> {
    fn from(e: BreakerFailing) -> Self {
        Self::BreakerFailing(e)
    }
}

impl<E> From<BulkheadFull> for PolicyError<E> {
    fn from(e: BulkheadFull) -> Self {
        Self::BulkheadFull(e)
    }
}

impl<E> From<BucketError> for PolicyError<E> {
    fn from(cause: BucketError) -> Self {
        Self::RateLimitExceeded(cause)
    }
}

impl<E> PolicyError<E> {
    /// Check if this error is due to retry exhaustion.
    pub fn is_attempts_exceeded(&self) -> bool {
        matches!(self, Self::AttemptsExceeded { .. })
    }

    /// Check if this error is due to the circuit breaker short-circuiting.
    pub fn is_breaker_failing(&self) -> bool {
        matches!(self, Self::BreakerFailing(_))
    }

    /// Check if this error is due to bulkhead rejection.
    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull(_))
    }

    /// Check if this error is due to rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded(_))
    }

    /// Check if this error is due to a deadline being hit.
    pub fn is_max_duration_exceeded(&self) -> bool {
        matches!(self, Self::MaxDurationExceeded { .. })
    }

    /// Check if this error wraps an operation error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the operation error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the operation error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access the recorded failure window for `AttemptsExceeded`, if present.
    pub fn failures(&self) -> Option<&[SharedError]> {
        match self {
            Self::AttemptsExceeded { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

/// Invalid policy parameters detected at construction time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("attempts must be greater than zero")]
    ZeroAttempts,
    #[error("timeout duration must be greater than zero")]
    ZeroDuration,
    #[error("duration {requested:?} exceeds maximum allowed {limit:?}")]
    ExceedsMaximum { requested: Duration, limit: Duration },
    #[error("interval backoff requires at least one delay")]
    EmptyIntervals,
    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },
    #[error("max_capacity ({max_capacity}) must be at least max_concurrency ({max_concurrency})")]
    CapacityBelowConcurrency { max_concurrency: usize, max_capacity: usize },
    #[error("fallback requires an error matcher or a result predicate")]
    UnguardedFallback,
}
