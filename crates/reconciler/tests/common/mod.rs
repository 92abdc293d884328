//! Shared fixtures: a scriptable provider and a controller wired to the
//! in-memory stores.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{ReconcileRequest, ResourceKey, ResourceStatus};
use converge_reconciler::{
    Action, Controller, ControllerConfig, DataRef, ExternalClient, FetchError, FetchRequest,
    InMemoryDesiredStore, InMemoryObservedStore, ObjectMeta, Provider, ProviderRegistry,
    RefreshConfig, RefreshPolicy, SecretData, SweepQueue, SyncSpec, SyncedResource,
};
use parking_lot::Mutex;

pub const PROVIDER: &str = "fake";
pub const NAMESPACE: &str = "default";
pub const HOUR: Duration = Duration::from_secs(3600);

/// Remote values plus knobs for scripting failures.
#[derive(Default)]
pub struct FakeBackend {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
    failure: Mutex<Option<FetchError>>,
    hang: AtomicBool,
    explode: AtomicBool,
    fetches: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl FakeBackend {
    pub fn with_values(pairs: &[(&str, &str)]) -> Arc<Self> {
        let backend = Self::default();
        for (k, v) in pairs {
            backend.set(k, v);
        }
        Arc::new(backend)
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .insert(key.to_owned(), value.as_bytes().to_vec());
    }

    pub fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }

    pub fn fail_with(&self, error: Option<FetchError>) {
        *self.failure.lock() = error;
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_explode(&self, explode: bool) {
        self.explode.store(explode, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

struct FakeClient(Arc<FakeBackend>);

#[async_trait]
impl ExternalClient for FakeClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<SecretData, FetchError> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        if self.0.explode.load(Ordering::SeqCst) {
            panic!("provider exploded");
        }
        if self.0.hang.load(Ordering::SeqCst) {
            return futures::future::pending().await;
        }
        if let Some(error) = self.0.failure.lock().clone() {
            return Err(error);
        }

        let values = self.0.values.lock();
        request
            .refs
            .iter()
            .map(|r| {
                values
                    .get(&r.remote_key)
                    .map(|v| (r.effective_target_key().to_owned(), v.clone()))
                    .ok_or_else(|| FetchError::not_found_upstream(&r.remote_key))
            })
            .collect()
    }

    async fn commit(&self, _resource: &ResourceKey) -> Result<(), FetchError> {
        self.0.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _resource: &ResourceKey) -> Result<(), FetchError> {
        self.0.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProvider(pub Arc<FakeBackend>);

#[async_trait]
impl Provider for FakeProvider {
    async fn client(
        &self,
        _resource: &SyncedResource,
    ) -> Result<Arc<dyn ExternalClient>, FetchError> {
        Ok(Arc::new(FakeClient(Arc::clone(&self.0))))
    }
}

/// A resource copying `db/password` into key `password` of a same-named
/// target, refreshed hourly.
pub fn secret_resource(name: &str) -> SyncedResource {
    SyncedResource::new(
        ObjectMeta::new(NAMESPACE, name),
        SyncSpec {
            provider: PROVIDER.to_owned(),
            refresh: RefreshConfig::new(RefreshPolicy::Periodic, HOUR),
            data: vec![DataRef::new("password", "db/password")],
            ..SyncSpec::default()
        },
    )
}

pub struct Harness {
    pub desired: Arc<InMemoryDesiredStore>,
    pub observed: Arc<InMemoryObservedStore>,
    pub backend: Arc<FakeBackend>,
    pub sweeper: Arc<SweepQueue>,
    pub controller: Controller,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        converge_reconciler::telemetry::init_for_tests();

        let desired = Arc::new(InMemoryDesiredStore::new());
        let observed = Arc::new(InMemoryObservedStore::new());
        let backend = FakeBackend::with_values(&[("db/password", "s3cret")]);
        let sweeper = Arc::new(SweepQueue::new());
        let providers = ProviderRegistry::builder()
            .register(PROVIDER, Arc::new(FakeProvider(Arc::clone(&backend))))
            .build()
            .unwrap();

        let controller = Controller::builder()
            .with_in_memory_stores(Arc::clone(&desired), Arc::clone(&observed))
            .with_providers(providers)
            .with_sweeper(sweeper.clone())
            .with_config(config)
            .build()
            .unwrap();

        Self {
            desired,
            observed,
            backend,
            sweeper,
            controller,
        }
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Action {
        self.controller
            .reconciler()
            .reconcile(
                &ReconcileRequest::new(key.clone()),
                self.controller.shutdown_token(),
            )
            .await
    }

    pub fn status(&self, key: &ResourceKey) -> ResourceStatus {
        self.desired.snapshot(key).unwrap().status
    }
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
