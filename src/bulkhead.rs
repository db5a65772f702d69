//! Bulkhead: caps concurrent operations and bounds the queue behind them.
//!
//! Two semaphores drive admission. `capacity` covers everything in flight or
//! queued; when it is exhausted the call is rejected outright. `concurrency`
//! covers actively running operations; when it is exhausted the caller waits
//! cooperatively for a worker slot. Together they model "N workers with M
//! callers admitted overall".

use crate::error::{BulkheadFull, ConfigError, PolicyError};
use crate::events::{derive_name, EventDispatcher, EventTracker, ListenerRegistry};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Context handed to bulkhead listeners.
#[derive(Debug, Clone)]
pub struct BulkheadContext {
    name: Arc<str>,
}

impl BulkheadContext {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Listener for bulkhead lifecycle events. Implement only the events you care
/// about; the rest default to no-ops.
#[async_trait]
pub trait BulkheadListener: Send + Sync {
    async fn on_bulkhead_full(&self, _bulkhead: BulkheadContext) {}
}

/// Process-wide listener registry shared by every bulkhead.
pub fn bulkhead_listeners() -> &'static ListenerRegistry<BulkheadContext, dyn BulkheadListener> {
    static REGISTRY: OnceLock<ListenerRegistry<BulkheadContext, dyn BulkheadListener>> =
        OnceLock::new();
    REGISTRY.get_or_init(ListenerRegistry::new)
}

/// Limits concurrent operations and bounds total in-flight-plus-queued work.
#[derive(Clone)]
pub struct BulkheadPolicy {
    concurrency: Arc<Semaphore>,
    capacity: Arc<Semaphore>,
    max_concurrency: usize,
    max_capacity: usize,
    context: BulkheadContext,
    events: Arc<EventDispatcher<BulkheadContext, dyn BulkheadListener>>,
}

/// Admission held by a caller inside the bulkhead. Dropping it releases the
/// worker slot first and the capacity slot second.
#[derive(Debug)]
pub struct BulkheadPermit {
    _concurrency: OwnedSemaphorePermit,
    _capacity: OwnedSemaphorePermit,
}

impl std::fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPolicy")
            .field("name", &self.context.name())
            .field("max_concurrency", &self.max_concurrency)
            .field("max_capacity", &self.max_capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl BulkheadPolicy {
    pub fn builder(max_concurrency: usize, max_capacity: usize) -> BulkheadBuilder {
        BulkheadBuilder {
            max_concurrency,
            max_capacity,
            name: None,
            listeners: Vec::new(),
            registry: Some(bulkhead_listeners().clone()),
            tracker: None,
        }
    }

    pub fn new(max_concurrency: usize, max_capacity: usize) -> Result<Self, ConfigError> {
        Self::builder(max_concurrency, max_capacity).build()
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Operations currently admitted (running or queued).
    pub fn in_flight(&self) -> usize {
        self.max_capacity.saturating_sub(self.capacity.available_permits())
    }

    /// Scoped form: admit the caller, waiting for a worker slot if every
    /// worker is busy, or reject immediately when the total capacity is spent.
    /// Cancelling the wait consumes nothing.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadFull> {
        let capacity = match Arc::clone(&self.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let full =
                    BulkheadFull { in_flight: self.in_flight(), max_capacity: self.max_capacity };
                tracing::debug!(bulkhead = self.context.name(), "bulkhead at capacity");
                let context = self.context.clone();
                self.events.publish(move |listener| {
                    let bulkhead = context.clone();
                    async move { listener.on_bulkhead_full(bulkhead).await }
                });
                return Err(full);
            }
        };

        match Arc::clone(&self.concurrency).acquire_owned().await {
            Ok(concurrency) => Ok(BulkheadPermit { _concurrency: concurrency, _capacity: capacity }),
            // The semaphores are never closed; treat it as saturation anyway.
            Err(_) => {
                Err(BulkheadFull { in_flight: self.in_flight(), max_capacity: self.max_capacity })
            }
        }
    }

    /// Wrapper form: run one operation inside the bulkhead.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = self.acquire().await?;
        let result = operation().await;
        drop(permit);
        result
    }
}

pub struct BulkheadBuilder {
    max_concurrency: usize,
    max_capacity: usize,
    name: Option<Arc<str>>,
    listeners: Vec<Arc<dyn BulkheadListener>>,
    registry: Option<ListenerRegistry<BulkheadContext, dyn BulkheadListener>>,
    tracker: Option<EventTracker>,
}

impl BulkheadBuilder {
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn BulkheadListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Swap the process-wide registry for another one (or none).
    pub fn registry(
        mut self,
        registry: Option<ListenerRegistry<BulkheadContext, dyn BulkheadListener>>,
    ) -> Self {
        self.registry = registry;
        self
    }

    pub fn tracker(mut self, tracker: EventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<BulkheadPolicy, ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::NonPositive { name: "max_concurrency" });
        }
        if self.max_capacity == 0 {
            return Err(ConfigError::NonPositive { name: "max_capacity" });
        }
        if self.max_capacity < self.max_concurrency {
            return Err(ConfigError::CapacityBelowConcurrency {
                max_concurrency: self.max_concurrency,
                max_capacity: self.max_capacity,
            });
        }

        let context =
            BulkheadContext { name: self.name.unwrap_or_else(|| derive_name("bulkhead")) };
        let events = Arc::new(EventDispatcher::new(
            context.clone(),
            self.listeners,
            self.registry,
            self.tracker,
        ));

        Ok(BulkheadPolicy {
            concurrency: Arc::new(Semaphore::new(self.max_concurrency)),
            capacity: Arc::new(Semaphore::new(self.max_capacity)),
            max_concurrency: self.max_concurrency,
            max_capacity: self.max_capacity,
            context,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn quiet(max_concurrency: usize, max_capacity: usize) -> BulkheadPolicy {
        BulkheadPolicy::builder(max_concurrency, max_capacity).registry(None).build().unwrap()
    }

    #[tokio::test]
    async fn allows_operations_within_limits() {
        let bulkhead = quiet(3, 3);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            let result = bulkhead
                .execute(|| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, PolicyError<TestError>>(42)
                    }
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[tokio::test]
    async fn rejects_immediately_when_capacity_is_spent() {
        let bulkhead = quiet(1, 1);

        let held = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 1);

        let rejected = bulkhead.execute(|| async { Ok::<_, PolicyError<TestError>>(()) }).await;
        match rejected.unwrap_err() {
            PolicyError::BulkheadFull(full) => {
                assert_eq!(full.in_flight, 1);
                assert_eq!(full.max_capacity, 1);
            }
            e => panic!("expected a bulkhead rejection, got {:?}", e),
        }

        drop(held);
        let admitted = bulkhead.execute(|| async { Ok::<_, PolicyError<TestError>>(7) }).await;
        assert_eq!(admitted.unwrap(), 7);
    }

    #[tokio::test]
    async fn queues_when_workers_are_busy_but_capacity_remains() {
        let bulkhead = quiet(1, 2);

        let holder = bulkhead.acquire().await.unwrap();

        // A second caller fits in capacity and waits for the worker slot.
        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let permit = bulkhead.acquire().await.unwrap();
                drop(permit);
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter should be queued, not rejected");
        assert_eq!(bulkhead.in_flight(), 2);

        // A third caller exceeds capacity and is rejected immediately.
        let rejected = bulkhead.acquire().await;
        assert!(rejected.is_err());

        drop(holder);
        waiter.await.unwrap();
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiters_consume_nothing() {
        let bulkhead = quiet(1, 2);

        let holder = bulkhead.acquire().await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let _ = bulkhead.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bulkhead.in_flight(), 1, "aborted waiter must release its capacity slot");

        drop(holder);
        assert!(bulkhead.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let bulkhead = quiet(5, 10);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let bulkhead = bulkhead.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| {
                        let active = active.clone();
                        let peak = peak.clone();
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, PolicyError<TestError>>(())
                        }
                    })
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap().is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 5, "worker slots must bound concurrency");
    }

    #[tokio::test]
    async fn saturation_notifies_listeners() {
        #[derive(Default)]
        struct Counting {
            rejections: AtomicUsize,
        }

        #[async_trait]
        impl BulkheadListener for Counting {
            async fn on_bulkhead_full(&self, _bulkhead: BulkheadContext) {
                self.rejections.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counting = Arc::new(Counting::default());
        let tracker = EventTracker::new();
        let bulkhead = BulkheadPolicy::builder(1, 1)
            .listener(counting.clone())
            .registry(None)
            .tracker(tracker.clone())
            .build()
            .unwrap();

        let held = bulkhead.acquire().await.unwrap();
        assert!(bulkhead.acquire().await.is_err());
        drop(held);

        tracker.await_all().await;
        assert_eq!(counting.rejections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn operation_errors_propagate() {
        let bulkhead = quiet(2, 2);

        let result = bulkhead
            .execute(|| async {
                Err::<(), _>(PolicyError::Inner(TestError("operation failed".into())))
            })
            .await;

        assert!(matches!(result.unwrap_err(), PolicyError::Inner(e) if e.0 == "operation failed"));
    }

    #[test]
    fn invalid_limits_are_rejected() {
        assert_eq!(
            BulkheadPolicy::new(0, 1).unwrap_err(),
            ConfigError::NonPositive { name: "max_concurrency" }
        );
        assert_eq!(
            BulkheadPolicy::new(1, 0).unwrap_err(),
            ConfigError::NonPositive { name: "max_capacity" }
        );
        assert_eq!(
            BulkheadPolicy::new(4, 2).unwrap_err(),
            ConfigError::CapacityBelowConcurrency { max_concurrency: 4, max_capacity: 2 }
        );
    }
}
