//! Cross-cutting listener behavior: isolation, shared registries, factories.

mod common;

use async_trait::async_trait;
use common::TestError;
use redoubt::{
    Backoff, EventTracker, InstantSleeper, ListenerRegistry, PolicyError, RetryContext,
    RetryListener, RetryPolicy, SharedError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recording {
    retries: AtomicUsize,
    successes: AtomicUsize,
    names: Mutex<Vec<String>>,
}

#[async_trait]
impl RetryListener for Recording {
    async fn on_retry(
        &self,
        retry: RetryContext,
        _error: SharedError,
        _attempt: usize,
        _delay: Duration,
    ) {
        self.names.lock().unwrap().push(retry.name().to_string());
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_success(&self, _retry: RetryContext, _attempts: usize) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Exploding;

#[async_trait]
impl RetryListener for Exploding {
    async fn on_retry(
        &self,
        _retry: RetryContext,
        _error: SharedError,
        _attempt: usize,
        _delay: Duration,
    ) {
        panic!("listener failure must stay inside the dispatch task");
    }
}

#[tokio::test]
async fn a_panicking_listener_never_disturbs_the_engine() {
    common::init_tracing();
    let recording = Arc::new(Recording::default());
    let tracker = EventTracker::new();

    let policy: RetryPolicy<TestError> = RetryPolicy::builder()
        .attempts(3)
        .backoff(Backoff::constant(Duration::ZERO))
        .sleeper(InstantSleeper)
        .listener(Arc::new(Exploding))
        .listener(recording.clone())
        .registry(None)
        .tracker(tracker.clone())
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_op = calls.clone();
    let result = policy
        .execute(|| {
            let calls = calls_in_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(PolicyError::Inner(TestError::new("transient")))
                } else {
                    Ok("through")
                }
            }
        })
        .await;

    // The engine's outcome and its later events are unaffected.
    assert_eq!(result.unwrap(), "through");
    tracker.await_all().await;
    assert_eq!(recording.successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn an_injected_registry_observes_every_engine_of_its_kind() {
    common::init_tracing();
    let recording = Arc::new(Recording::default());
    let registry: ListenerRegistry<RetryContext, dyn RetryListener> = ListenerRegistry::new();
    registry.register(recording.clone());

    let tracker = EventTracker::new();
    let build = |name: &str| -> RetryPolicy<TestError> {
        RetryPolicy::builder()
            .attempts(2)
            .backoff(Backoff::constant(Duration::ZERO))
            .sleeper(InstantSleeper)
            .name(name)
            .registry(Some(registry.clone()))
            .tracker(tracker.clone())
            .build()
            .unwrap()
    };

    for name in ["orders", "payments"] {
        let policy = build(name);
        let failed_once = AtomicUsize::new(0);
        let _ = policy
            .execute(|| {
                let first = failed_once.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(PolicyError::Inner(TestError::new("transient")))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
    }

    tracker.await_all().await;
    assert_eq!(recording.retries.load(Ordering::SeqCst), 2);
    assert_eq!(recording.successes.load(Ordering::SeqCst), 2);
    let mut names = recording.names.lock().unwrap().clone();
    names.sort();
    assert_eq!(names, vec!["orders".to_string(), "payments".to_string()]);
}

#[tokio::test]
async fn registry_factories_build_one_listener_per_engine() {
    common::init_tracing();
    let built_for: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recording = Arc::new(Recording::default());

    let registry: ListenerRegistry<RetryContext, dyn RetryListener> = ListenerRegistry::new();
    let built = built_for.clone();
    let instance = recording.clone();
    registry.register_factory(move |retry: &RetryContext| {
        built.lock().unwrap().push(retry.name().to_string());
        instance.clone() as Arc<dyn RetryListener>
    });

    let tracker = EventTracker::new();
    let policy: RetryPolicy<TestError> = RetryPolicy::builder()
        .attempts(2)
        .backoff(Backoff::constant(Duration::ZERO))
        .sleeper(InstantSleeper)
        .name("lookup")
        .registry(Some(registry))
        .tracker(tracker.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        let _ = policy.execute(|| async { Ok::<_, PolicyError<TestError>>(()) }).await;
    }

    tracker.await_all().await;
    assert_eq!(*built_for.lock().unwrap(), vec!["lookup".to_string()]);
    assert_eq!(recording.successes.load(Ordering::SeqCst), 3);
}
