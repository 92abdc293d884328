//! BDD-style behavioral tests for the worker pool, end to end.
//!
//! A controller runs real workers over the in-memory stores; tests observe
//! convergence by polling the stores.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, secret_resource, FakeBackend, FakeProvider, Harness, PROVIDER};
use converge_core::ResourceKey;
use converge_reconciler::{
    Controller, DeletionPolicy, DesiredStore, EntryState, FetchError, InMemoryDesiredStore,
    InMemoryObservedStore, ProviderRegistry, SyncedResource, WorkQueue,
};
use converge_reconciler::queue::ExponentialFailureRateLimiter;
use parking_lot::Mutex;

const WITHIN: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════════════════════
// QUEUE BEHAVIORS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_many_workers_when_keys_flood_in_then_no_key_is_processed_twice_at_once() {
    // Given: A queue drained by eight workers that track what is in flight
    let queue: WorkQueue<String> =
        WorkQueue::new(Box::new(ExponentialFailureRateLimiter::default()));
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let (queue, in_flight) = (queue.clone(), Arc::clone(&in_flight));
            let (overlaps, processed) = (Arc::clone(&overlaps), Arc::clone(&processed));
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    if !in_flight.lock().insert(key.clone()) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.lock().remove(&key);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            })
        })
        .collect();

    // When: A burst of adds lands on four keys while they are being processed
    for round in 0..200 {
        queue.add(format!("key-{}", round % 4));
    }
    assert!(eventually(WITHIN, || queue.is_empty()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shutdown();
    for worker in workers {
        worker.await.unwrap();
    }

    // Then: No key was ever held by two workers, and adds were collapsed
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let processed = processed.load(Ordering::SeqCst);
    assert!((4..200).contains(&processed), "processed {processed}");
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER BEHAVIORS
// ═══════════════════════════════════════════════════════════════════════════════

fn start(h: &Harness) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = h.controller.start();
    handles.push(h.controller.pump(h.desired.subscribe()));
    handles
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_running_controller_when_resource_applied_then_object_converges() {
    // Given: A running controller
    let h = Harness::new();
    let handles = start(&h);

    // When: A resource is applied
    let key = h.desired.apply(secret_resource("db")).key();

    // Then: The managed object appears and the resource reports ready
    assert!(eventually(WITHIN, || h.observed.snapshot(&key).is_some()).await);
    assert!(eventually(WITHIN, || h.status(&key).is_ready()).await);

    // And: Follow-up events settle without extra provider calls
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.fetches(), 1);

    h.controller.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_synced_object_when_edited_out_of_band_then_watch_restores_it() {
    // Given: A running controller with one synced resource
    let h = Harness::new();
    let handles = start(&h);
    let key = h.desired.apply(secret_resource("db")).key();
    assert!(eventually(WITHIN, || h.status(&key).is_ready()).await);

    // When: Someone overwrites the managed data
    h.observed.modify(&key, |o| {
        o.data.insert("password".into(), b"hacked".to_vec());
    });

    // Then: The watch requeues the owner and the data is restored
    let restored = eventually(WITHIN, || {
        h.observed
            .snapshot(&key)
            .and_then(|o| o.data.get("password").cloned())
            .is_some_and(|v| v == b"s3cret")
    })
    .await;
    assert!(restored);
    assert_eq!(h.backend.fetches(), 2);

    h.controller.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_transient_failures_when_provider_recovers_then_resource_converges() {
    // Given: A provider that fails until told otherwise
    let h = Harness::with_config(converge_reconciler::ControllerConfig {
        backoff_base_ms: 5,
        ..converge_reconciler::ControllerConfig::default()
    });
    h.backend.fail_with(Some(FetchError::transient("unavailable")));
    let handles = start(&h);
    let key = h.desired.apply(secret_resource("db")).key();

    // When: Several attempts have failed and the provider recovers
    assert!(eventually(WITHIN, || h.backend.fetches() >= 3).await);
    assert!(h.controller.queue().num_requeues(&key) >= 1);
    h.backend.fail_with(None);

    // Then: The rate-limited retry succeeds and backoff is reset
    assert!(eventually(WITHIN, || h.status(&key).is_ready()).await);
    assert!(eventually(WITHIN, || h.controller.queue().num_requeues(&key) == 0).await);

    h.controller.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_running_controller_when_resource_deleted_then_finalizer_cleans_up() {
    // Given: A synced resource with the delete policy
    let h = Harness::new();
    let handles = start(&h);
    let mut resource = secret_resource("db");
    resource.spec.target.deletion_policy = DeletionPolicy::Delete;
    let key = h.desired.apply(resource).key();
    assert!(eventually(WITHIN, || h.status(&key).is_ready()).await);

    // When: The resource is deleted
    h.desired.request_deletion(&key);

    // Then: Both the resource and its managed object disappear
    assert!(eventually(WITHIN, || h.desired.snapshot(&key).is_none()).await);
    assert!(eventually(WITHIN, || h.observed.snapshot(&key).is_none()).await);

    h.controller.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_many_resources_when_applied_together_then_all_converge() {
    // Given: A running controller
    let h = Harness::new();
    let handles = start(&h);

    // When: Twenty resources are applied at once
    let keys: Vec<ResourceKey> = (0..20)
        .map(|i| h.desired.apply(secret_resource(&format!("db-{i}"))).key())
        .collect();

    // Then: Every one of them converges exactly once
    assert!(eventually(WITHIN, || keys.iter().all(|k| h.status(k).is_ready())).await);
    assert_eq!(h.observed.len(), 20);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.fetches(), 20);

    h.controller.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn given_idle_workers_when_controller_shut_down_then_run_returns() {
    // Given: A controller whose workers are blocked on an empty queue
    let h = Harness::new();
    let controller = h.controller.clone();
    let running = tokio::spawn(async move { controller.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // When: It is shut down
    h.controller.shutdown();

    // Then: Every worker exits
    tokio::time::timeout(WITHIN, running)
        .await
        .expect("workers should stop")
        .unwrap();
    assert!(h.controller.queue().is_shutting_down());
}

/// Delegates to the in-memory store, but the first read panics.
struct PanicOnFirstRead {
    inner: Arc<InMemoryDesiredStore>,
    armed: AtomicBool,
}

#[async_trait]
impl DesiredStore for PanicOnFirstRead {
    async fn get(&self, key: &ResourceKey) -> converge_reconciler::Result<Option<SyncedResource>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("desired store blew up");
        }
        self.inner.get(key).await
    }

    async fn update(&self, resource: &SyncedResource) -> converge_reconciler::Result<SyncedResource> {
        self.inner.update(resource).await
    }

    async fn keys(&self) -> converge_reconciler::Result<Vec<ResourceKey>> {
        self.inner.keys().await
    }
}

#[tokio::test]
async fn given_store_read_panics_when_key_processed_then_key_is_released_and_retried() {
    // Given: A controller whose desired store panics on its first read
    let desired = Arc::new(InMemoryDesiredStore::new());
    let observed = Arc::new(InMemoryObservedStore::new());
    let backend = FakeBackend::with_values(&[("db/password", "s3cret")]);
    let controller = Controller::builder()
        .with_in_memory_stores(Arc::clone(&desired), Arc::clone(&observed))
        .with_desired_store(Arc::new(PanicOnFirstRead {
            inner: Arc::clone(&desired),
            armed: AtomicBool::new(true),
        }))
        .with_providers(
            ProviderRegistry::builder()
                .register(PROVIDER, Arc::new(FakeProvider(Arc::clone(&backend))))
                .build()
                .unwrap(),
        )
        .with_config(converge_reconciler::ControllerConfig {
            backoff_base_ms: 5,
            ..converge_reconciler::ControllerConfig::default()
        })
        .build()
        .unwrap();
    let key = desired.apply(secret_resource("db")).key();

    // When: The key is processed and the read panics
    controller.enqueue(key.clone());
    assert!(controller.process_next_work_item().await);

    // Then: The worker survives and the key is no longer held
    let state = controller.queue().entry_state(&key);
    assert!(
        matches!(state, Some(EntryState::Waiting | EntryState::Pending)),
        "state {state:?}"
    );
    assert_eq!(controller.queue().num_requeues(&key), 1);

    // And: The backoff retry converges the resource
    let processed = tokio::time::timeout(WITHIN, controller.process_next_work_item())
        .await
        .unwrap();
    assert!(processed);
    assert!(desired.snapshot(&key).unwrap().status.is_ready());
    assert!(observed.snapshot(&key).is_some());
}
