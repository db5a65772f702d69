//! Timeout policy for bounding async operation duration.
//!
//! The wrapper form races the operation against a deadline with
//! `tokio::time::timeout`; on expiry the operation future is dropped, which is
//! cooperative cancellation — the operation stops at its next suspension
//! point. Cancellation-unsafe work may leave partial state behind; prefer
//! cancellation-safe primitives when that matters. The scoped form
//! ([`TimeoutPolicy::bound`]) brackets an already-constructed future; use a
//! fresh call per region.

use crate::error::{ConfigError, PolicyError};
use crate::events::{derive_name, EventDispatcher, EventTracker, ListenerRegistry};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout (30 days), guarding accidental `u64::MAX`-style
/// configs while leaving room for long jobs. Raise it per policy via
/// [`TimeoutBuilder::max`] when longer horizons are required.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Context handed to timeout listeners.
#[derive(Debug, Clone)]
pub struct TimeoutContext {
    name: Arc<str>,
}

impl TimeoutContext {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Listener for timeout lifecycle events. Implement only the events you care
/// about; the rest default to no-ops.
#[async_trait]
pub trait TimeoutListener: Send + Sync {
    async fn on_timeout(&self, _timeout: TimeoutContext) {}
}

/// Process-wide listener registry shared by every timeout policy.
pub fn timeout_listeners() -> &'static ListenerRegistry<TimeoutContext, dyn TimeoutListener> {
    static REGISTRY: OnceLock<ListenerRegistry<TimeoutContext, dyn TimeoutListener>> =
        OnceLock::new();
    REGISTRY.get_or_init(ListenerRegistry::new)
}

/// Enforces a maximum duration on async operations.
#[derive(Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
    context: TimeoutContext,
    events: Arc<EventDispatcher<TimeoutContext, dyn TimeoutListener>>,
}

impl std::fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("name", &self.context.name())
            .field("duration", &self.duration)
            .finish()
    }
}

impl TimeoutPolicy {
    pub fn builder(duration: Duration) -> TimeoutBuilder {
        TimeoutBuilder {
            duration,
            limit: MAX_TIMEOUT,
            name: None,
            listeners: Vec::new(),
            registry: Some(timeout_listeners().clone()),
            tracker: None,
        }
    }

    /// Create a timeout policy with the specified duration.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        Self::builder(duration).build()
    }

    /// The configured deadline.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Wrapper form: invoke the operation and race it against the deadline.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.bound(operation()).await
    }

    /// Scoped form: bracket an already-constructed future with the deadline.
    ///
    /// On expiry the future is dropped, `on_timeout` is dispatched, and the
    /// caller sees `MaxDurationExceeded` with the measured elapsed time.
    pub async fn bound<T, E, Fut>(&self, future: Fut) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, future).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::debug!(
                    timeout = self.context.name(),
                    ?elapsed,
                    limit = ?self.duration,
                    "operation timed out"
                );
                let context = self.context.clone();
                self.events.publish(move |listener| {
                    let timeout = context.clone();
                    async move { listener.on_timeout(timeout).await }
                });
                Err(PolicyError::MaxDurationExceeded { elapsed, limit: self.duration })
            }
        }
    }
}

pub struct TimeoutBuilder {
    duration: Duration,
    limit: Duration,
    name: Option<Arc<str>>,
    listeners: Vec<Arc<dyn TimeoutListener>>,
    registry: Option<ListenerRegistry<TimeoutContext, dyn TimeoutListener>>,
    tracker: Option<EventTracker>,
}

impl TimeoutBuilder {
    /// Override the maximum accepted duration (defaults to [`MAX_TIMEOUT`]).
    pub fn max(mut self, limit: Duration) -> Self {
        self.limit = limit;
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn TimeoutListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<TimeoutContext, dyn TimeoutListener>>,
    ) -> Self {
        self.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<TimeoutPolicy, ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.duration > self.limit {
            return Err(ConfigError::ExceedsMaximum {
                requested: self.duration,
                limit: self.limit,
            });
        }

        let context =
            TimeoutContext { name: self.name.unwrap_or_else(|| derive_name("timeout")) };
        let events = Arc::new(EventDispatcher::new(
            context.clone(),
            self.listeners,
            self.registry,
            self.tracker,
        ));

        Ok(TimeoutPolicy { duration: self.duration, context, events })
    }
}
