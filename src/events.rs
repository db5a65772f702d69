//! Listener fabric shared by every policy engine.
//!
//! Each engine owns an [`EventDispatcher`] that fans lifecycle events out to
//! listeners. Listeners come from two places: local listeners attached to one
//! engine instance, and a [`ListenerRegistry`] shared by every engine of the
//! same kind (one process-wide registry per policy kind, with fresh registries
//! injectable in tests). Dispatch is fire-and-forget: the engine never waits
//! for listeners, and a listener that panics only takes down its own dispatch
//! task.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::join_all;
use tokio::task::JoinHandle;

/// A listener factory is resolved lazily, on the first event an engine
/// publishes, with that engine's context as argument.
type ListenerFactory<C, L> = Arc<dyn Fn(&C) -> Arc<L> + Send + Sync>;

enum Registered<C, L: ?Sized> {
    Instance(Arc<L>),
    Factory(ListenerFactory<C, L>),
}

/// Insertion-ordered collection of listeners (or listener factories) shared by
/// every engine of one policy kind.
///
/// The registry is a cheap handle: clones share the same underlying list, so a
/// process-wide registry can be handed to many engines while tests construct
/// fresh ones per case.
pub struct ListenerRegistry<C, L: ?Sized> {
    entries: Arc<Mutex<Vec<Registered<C, L>>>>,
}

impl<C, L: ?Sized> Clone for ListenerRegistry<C, L> {
    fn clone(&self) -> Self {
        Self { entries: Arc::clone(&self.entries) }
    }
}

impl<C, L: ?Sized> Default for ListenerRegistry<C, L> {
    fn default() -> Self {
        Self { entries: Arc::new(Mutex::new(Vec::new())) }
    }
}

impl<C, L: ?Sized> ListenerRegistry<C, L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener instance for every engine of this kind.
    pub fn register(&self, listener: Arc<L>) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Registered::Instance(listener));
    }

    /// Register a factory invoked once per engine, with the engine's context,
    /// when that engine dispatches its first event.
    pub fn register_factory<F>(&self, factory: F)
    where
        F: Fn(&C) -> Arc<L> + Send + Sync + 'static,
    {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Registered::Factory(Arc::new(factory)));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, context: &C) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|entry| match entry {
                Registered::Instance(listener) => Arc::clone(listener),
                Registered::Factory(factory) => factory(context),
            })
            .collect()
    }
}

/// Tracks in-flight listener dispatch tasks so shutdown can drain or abort
/// them. Finished tasks are pruned as new ones are tracked.
#[derive(Debug, Clone, Default)]
pub struct EventTracker {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(task);
    }

    /// Wait for every outstanding listener task dispatched so far.
    pub async fn await_all(&self) {
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };

        for task in drained {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::warn!("listener task panicked: {err}");
                }
            }
        }
    }

    /// Abort every outstanding listener task, then wait for them to settle.
    pub async fn cancel_all(&self) {
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };

        for task in &drained {
            task.abort();
        }
        for task in drained {
            let _ = task.await;
        }
    }
}

/// Fans one engine's events out to its resolved listener list.
///
/// The effective list (local listeners followed by registry contents, with
/// factories invoked against the engine context) is materialized on the first
/// publish and cached for the dispatcher's lifetime; registrations made after
/// that point are not observed by this engine.
pub struct EventDispatcher<C, L: ?Sized> {
    context: C,
    local: Vec<Arc<L>>,
    registry: Option<ListenerRegistry<C, L>>,
    tracker: Option<EventTracker>,
    resolved: OnceLock<Arc<[Arc<L>]>>,
}

impl<C, L: ?Sized> EventDispatcher<C, L>
where
    C: Send + Sync,
    L: Send + Sync + 'static,
{
    pub(crate) fn new(
        context: C,
        local: Vec<Arc<L>>,
        registry: Option<ListenerRegistry<C, L>>,
        tracker: Option<EventTracker>,
    ) -> Self {
        Self { context, local, registry, tracker, resolved: OnceLock::new() }
    }

    fn resolved(&self) -> &Arc<[Arc<L>]> {
        self.resolved.get_or_init(|| {
            let mut all = self.local.clone();
            if let Some(registry) = &self.registry {
                all.extend(registry.resolve(&self.context));
            }
            all.into()
        })
    }

    /// Publish one event: spawn a task that invokes `event` once per resolved
    /// listener, concurrently, and return without waiting for any of them.
    pub(crate) fn publish<F, Fut>(&self, event: F)
    where
        F: Fn(Arc<L>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listeners = Arc::clone(self.resolved());
        if listeners.is_empty() {
            return;
        }

        let task = tokio::spawn(async move {
            join_all(listeners.iter().map(|listener| event(Arc::clone(listener)))).await;
        });

        if let Some(tracker) = &self.tracker {
            tracker.track(task);
        }
    }
}

/// Derive a unique engine name when the caller didn't supply one.
pub(crate) fn derive_name(kind: &str) -> Arc<str> {
    static SEQUENCE: AtomicUsize = AtomicUsize::new(1);
    let n = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{kind}-{n}").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Clone)]
    struct ProbeContext {
        name: Arc<str>,
    }

    #[async_trait]
    trait ProbeListener: Send + Sync {
        async fn on_ping(&self, _probe: ProbeContext, _n: usize) {}
    }

    #[derive(Default)]
    struct Recording {
        pings: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ProbeListener for Recording {
        async fn on_ping(&self, _probe: ProbeContext, n: usize) {
            self.pings.lock().unwrap().push(n);
        }
    }

    struct Panicking;

    #[async_trait]
    impl ProbeListener for Panicking {
        async fn on_ping(&self, _probe: ProbeContext, _n: usize) {
            panic!("listener blew up");
        }
    }

    fn dispatcher(
        local: Vec<Arc<dyn ProbeListener>>,
        registry: Option<ListenerRegistry<ProbeContext, dyn ProbeListener>>,
        tracker: Option<EventTracker>,
    ) -> EventDispatcher<ProbeContext, dyn ProbeListener> {
        EventDispatcher::new(ProbeContext { name: "probe".into() }, local, registry, tracker)
    }

    fn ping(
        dispatcher: &EventDispatcher<ProbeContext, dyn ProbeListener>,
        context: ProbeContext,
        n: usize,
    ) {
        dispatcher.publish(move |listener| {
            let probe = context.clone();
            async move { listener.on_ping(probe, n).await }
        });
    }

    #[tokio::test]
    async fn dispatch_reaches_local_and_registered_listeners() {
        let local = Arc::new(Recording::default());
        let registered = Arc::new(Recording::default());

        let registry: ListenerRegistry<ProbeContext, dyn ProbeListener> = ListenerRegistry::new();
        registry.register(registered.clone());

        let tracker = EventTracker::new();
        let dispatcher = dispatcher(
            vec![local.clone() as Arc<dyn ProbeListener>],
            Some(registry),
            Some(tracker.clone()),
        );

        ping(&dispatcher, ProbeContext { name: "probe".into() }, 7);
        tracker.await_all().await;

        assert_eq!(*local.pings.lock().unwrap(), vec![7]);
        assert_eq!(*registered.pings.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn factories_resolve_once_with_the_engine_context() {
        let seen_names: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let recording = Arc::new(Recording::default());

        let registry: ListenerRegistry<ProbeContext, dyn ProbeListener> = ListenerRegistry::new();
        let names = seen_names.clone();
        let built = recording.clone();
        registry.register_factory(move |probe: &ProbeContext| {
            names.lock().unwrap().push(probe.name.to_string());
            built.clone() as Arc<dyn ProbeListener>
        });

        let tracker = EventTracker::new();
        let dispatcher = dispatcher(Vec::new(), Some(registry), Some(tracker.clone()));

        ping(&dispatcher, ProbeContext { name: "probe".into() }, 1);
        ping(&dispatcher, ProbeContext { name: "probe".into() }, 2);
        tracker.await_all().await;

        // The factory ran exactly once despite two events.
        assert_eq!(*seen_names.lock().unwrap(), vec!["probe".to_string()]);
        let mut pings = recording.pings.lock().unwrap().clone();
        pings.sort_unstable();
        assert_eq!(pings, vec![1, 2]);
    }

    #[tokio::test]
    async fn resolution_freezes_after_the_first_publish() {
        let early = Arc::new(Recording::default());
        let late = Arc::new(Recording::default());

        let registry: ListenerRegistry<ProbeContext, dyn ProbeListener> = ListenerRegistry::new();
        registry.register(early.clone());

        let tracker = EventTracker::new();
        let dispatcher = dispatcher(Vec::new(), Some(registry.clone()), Some(tracker.clone()));

        ping(&dispatcher, ProbeContext { name: "probe".into() }, 1);
        tracker.await_all().await;

        registry.register(late.clone());
        ping(&dispatcher, ProbeContext { name: "probe".into() }, 2);
        tracker.await_all().await;

        assert_eq!(*early.pings.lock().unwrap(), vec![1, 2]);
        assert!(late.pings.lock().unwrap().is_empty(), "late registration must not be resolved");
    }

    #[tokio::test]
    async fn panicking_listener_does_not_disturb_the_publisher() {
        let tracker = EventTracker::new();
        let dispatcher = dispatcher(
            vec![Arc::new(Panicking) as Arc<dyn ProbeListener>],
            None,
            Some(tracker.clone()),
        );

        ping(&dispatcher, ProbeContext { name: "probe".into() }, 1);
        // Draining swallows the panic instead of propagating it here.
        tracker.await_all().await;
    }

    #[tokio::test]
    async fn cancel_all_aborts_slow_listeners() {
        struct Slow {
            finished: Arc<Mutex<bool>>,
        }

        #[async_trait]
        impl ProbeListener for Slow {
            async fn on_ping(&self, _probe: ProbeContext, _n: usize) {
                tokio::time::sleep(Duration::from_secs(60)).await;
                *self.finished.lock().unwrap() = true;
            }
        }

        let finished = Arc::new(Mutex::new(false));
        let tracker = EventTracker::new();
        let dispatcher = dispatcher(
            vec![Arc::new(Slow { finished: finished.clone() }) as Arc<dyn ProbeListener>],
            None,
            Some(tracker.clone()),
        );

        ping(&dispatcher, ProbeContext { name: "probe".into() }, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.cancel_all().await;

        assert!(!*finished.lock().unwrap(), "aborted listener must not run to completion");
    }

    #[test]
    fn derived_names_are_unique_per_kind() {
        let a = derive_name("probe");
        let b = derive_name("probe");
        assert_ne!(a, b);
        assert!(a.starts_with("probe-"));
    }
}
