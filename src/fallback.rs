//! Fallback: substitute a handler result when the operation fails matchingly
//! or when a predicate declares the successful result unacceptable.

use crate::error::{ConfigError, PolicyError, SharedError};
use crate::events::{derive_name, EventDispatcher, EventTracker, ListenerRegistry};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, OnceLock};

/// What the handler is asked to substitute for.
#[derive(Debug)]
pub enum FallbackCause<T, E> {
    /// The operation failed and the error matched.
    Failure(Arc<PolicyError<E>>),
    /// The operation succeeded but the result predicate rejected the value.
    Rejected(T),
}

/// What triggered a fallback, as reported to listeners.
#[derive(Debug, Clone)]
pub enum FallbackTrigger {
    /// A matching error; the shared handle carries the original failure.
    MatchedError(SharedError),
    /// The result predicate rejected the operation's value.
    RejectedResult,
}

/// Context handed to fallback listeners.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    name: Arc<str>,
}

impl FallbackContext {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Listener for fallback lifecycle events. Implement only the events you care
/// about; the rest default to no-ops.
#[async_trait]
pub trait FallbackListener: Send + Sync {
    async fn on_fallback(&self, _fallback: FallbackContext, _trigger: FallbackTrigger) {}
}

/// Process-wide listener registry shared by every fallback policy.
pub fn fallback_listeners() -> &'static ListenerRegistry<FallbackContext, dyn FallbackListener> {
    static REGISTRY: OnceLock<ListenerRegistry<FallbackContext, dyn FallbackListener>> =
        OnceLock::new();
    REGISTRY.get_or_init(ListenerRegistry::new)
}

type Handler<T, E> =
    Arc<dyn Fn(FallbackCause<T, E>) -> BoxFuture<'static, Result<T, PolicyError<E>>> + Send + Sync>;

/// Substitutes the handler's result for matching failures or rejected results.
pub struct FallbackPolicy<T, E> {
    handler: Handler<T, E>,
    matches_error: Option<Arc<dyn Fn(&PolicyError<E>) -> bool + Send + Sync>>,
    rejects_result: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    context: FallbackContext,
    events: Arc<EventDispatcher<FallbackContext, dyn FallbackListener>>,
}

impl<T, E> Clone for FallbackPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            matches_error: self.matches_error.clone(),
            rejects_result: self.rejects_result.clone(),
            context: self.context.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<T, E> std::fmt::Debug for FallbackPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("name", &self.context.name())
            .field("matches_errors", &self.matches_error.is_some())
            .field("checks_results", &self.rejects_result.is_some())
            .finish()
    }
}

impl<T, E> FallbackPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Start a policy around `handler`, which produces the substitute value.
    /// At least one of [`FallbackBuilder::on_error`] /
    /// [`FallbackBuilder::when_result`] must be configured before `build`.
    pub fn builder<H, Fut>(handler: H) -> FallbackBuilder<T, E>
    where
        H: Fn(FallbackCause<T, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        FallbackBuilder {
            handler: Arc::new(move |cause| Box::pin(handler(cause))),
            matches_error: None,
            rejects_result: None,
            name: None,
            listeners: Vec::new(),
            registry: Some(fallback_listeners().clone()),
            tracker: None,
        }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Invoke the operation, substituting the handler's value for matching
    /// failures and predicate-rejected results. Non-matching errors propagate.
    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        match operation().await {
            Ok(value) => {
                if let Some(rejects) = &self.rejects_result {
                    if rejects(&value) {
                        self.publish(FallbackTrigger::RejectedResult);
                        return (self.handler)(FallbackCause::Rejected(value)).await;
                    }
                }
                Ok(value)
            }
            Err(error) => {
                let matched = self.matches_error.as_ref().is_some_and(|m| m(&error));
                if matched {
                    let shared = Arc::new(error);
                    self.publish(FallbackTrigger::MatchedError(
                        Arc::clone(&shared) as SharedError
                    ));
                    (self.handler)(FallbackCause::Failure(shared)).await
                } else {
                    Err(error)
                }
            }
        }
    }

    fn publish(&self, trigger: FallbackTrigger) {
        let context = self.context.clone();
        self.events.publish(move |listener| {
            let fallback = context.clone();
            let trigger = trigger.clone();
            async move { listener.on_fallback(fallback, trigger).await }
        });
    }
}

pub struct FallbackBuilder<T, E> {
    handler: Handler<T, E>,
    matches_error: Option<Arc<dyn Fn(&PolicyError<E>) -> bool + Send + Sync>>,
    rejects_result: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    name: Option<Arc<str>>,
    listeners: Vec<Arc<dyn FallbackListener>>,
    registry: Option<ListenerRegistry<FallbackContext, dyn FallbackListener>>,
    tracker: Option<EventTracker>,
}

impl<T, E> FallbackBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Substitute when a failure matches `predicate`.
    pub fn on_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.matches_error = Some(Arc::new(predicate));
        self
    }

    /// Substitute when the operation's value fails this acceptance check.
    pub fn when_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.rejects_result = Some(Arc::new(predicate));
        self
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn FallbackListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<FallbackContext, dyn FallbackListener>>,
    ) -> Self {
        self.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<FallbackPolicy<T, E>, ConfigError> {
        if self.matches_error.is_none() && self.rejects_result.is_none() {
            return Err(ConfigError::UnguardedFallback);
        }

        let context =
            FallbackContext { name: self.name.unwrap_or_else(|| derive_name("fallback")) };
        let events = Arc::new(EventDispatcher::new(
            context.clone(),
            self.listeners,
            self.registry,
            self.tracker,
        ));

        Ok(FallbackPolicy {
            handler: self.handler,
            matches_error: self.matches_error,
            rejects_result: self.rejects_result,
            context,
            events,
        })
    }
}
