//! Worker pool wiring the queue to the reconciler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use converge_core::{ReconcileRequest, ResourceKey};
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::provider::ProviderRegistry;
use crate::queue::{controller_rate_limiter, WorkQueue};
use crate::reconciler::{Action, Reconciler};
use crate::shutdown::Shutdown;
use crate::store::{DesiredStore, InMemoryDesiredStore, InMemoryObservedStore, ObservedStore, StatusSink};
use crate::transaction::OrphanSweeper;
use crate::watch::{Teardown, WatchManager, WatchStarter};

/// Runs reconciles for queued keys on a fixed pool of workers.
///
/// Cloning is cheap; clones drive the same queue.
#[derive(Debug, Clone)]
pub struct Controller {
    queue: WorkQueue<ResourceKey>,
    reconciler: Arc<Reconciler>,
    shutdown: Shutdown,
    workers: usize,
}

impl Controller {
    /// Start building a controller.
    #[must_use]
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// The work queue.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ResourceKey> {
        &self.queue
    }

    /// The reconciler the workers call.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The cancellation token handed to every attempt.
    #[must_use]
    pub fn shutdown_token(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Notify the controller that `key` changed.
    pub fn enqueue(&self, key: ResourceKey) {
        self.queue.add(key);
    }

    /// Forward every key from `changes` into the queue until shutdown.
    ///
    /// If the receiver falls behind, every key in the desired store is
    /// queued instead, so no dropped change goes unreconciled.
    pub fn pump(&self, mut changes: broadcast::Receiver<ResourceKey>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let desired = Arc::clone(self.reconciler.desired());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(key) => queue.add(key),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "change stream lagged, resyncing");
                            resync(&queue, desired.as_ref()).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("change pump stopped");
        })
    }

    /// Take one key off the queue and reconcile it.
    ///
    /// Returns false once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        // A panic anywhere in the attempt must still release the key.
        let request = ReconcileRequest::new(key.clone());
        let action = AssertUnwindSafe(self.reconciler.reconcile(&request, &self.shutdown))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(key = %key, "reconcile panicked, retrying with backoff");
                Action::RequeueRateLimited
            });

        match action {
            Action::Forget => self.queue.forget(&key),
            Action::RequeueAfter(delay) => {
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
            }
            Action::RequeueRateLimited => self.queue.add_rate_limited(key.clone()),
            Action::Requeue => self.queue.add(key.clone()),
        }
        self.queue.done(&key);
        true
    }

    /// Spawn the worker pool.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "starting workers");
        (0..self.workers)
            .map(|worker| {
                let controller = self.clone();
                tokio::spawn(async move {
                    while controller.process_next_work_item().await {}
                    debug!(worker, "worker stopped");
                })
            })
            .collect()
    }

    /// Run the worker pool until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        for joined in join_all(self.start()).await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
            }
        }
    }

    /// Stop the queue and cancel in-flight attempts.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.queue.shutdown();
    }
}

async fn resync(queue: &WorkQueue<ResourceKey>, desired: &dyn DesiredStore) {
    match desired.keys().await {
        Ok(keys) => {
            debug!(count = keys.len(), "resync queued every resource");
            for key in keys {
                queue.add(key);
            }
        }
        Err(e) => warn!(error = %e, "resync failed"),
    }
}

/// Builds a [`Controller`].
#[derive(Default)]
pub struct ControllerBuilder {
    desired: Option<Arc<dyn DesiredStore>>,
    status: Option<Arc<dyn StatusSink>>,
    observed: Option<Arc<dyn ObservedStore>>,
    observed_events: Option<Arc<InMemoryObservedStore>>,
    watch_starter: Option<Arc<dyn WatchStarter>>,
    providers: Option<ProviderRegistry>,
    sweeper: Option<Arc<dyn OrphanSweeper>>,
    config: ControllerConfig,
}

impl ControllerBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the desired-state store.
    #[must_use]
    pub fn with_desired_store(mut self, store: Arc<dyn DesiredStore>) -> Self {
        self.desired = Some(store);
        self
    }

    /// Set the status sink.
    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    /// Set the observed-state store.
    #[must_use]
    pub fn with_observed_store(mut self, store: Arc<dyn ObservedStore>) -> Self {
        self.observed = Some(store);
        self
    }

    /// Use the in-memory stores for everything, including watches.
    #[must_use]
    pub fn with_in_memory_stores(
        mut self,
        desired: Arc<InMemoryDesiredStore>,
        observed: Arc<InMemoryObservedStore>,
    ) -> Self {
        self.desired = Some(desired.clone());
        self.status = Some(desired);
        self.observed = Some(observed.clone());
        self.observed_events = Some(observed);
        self
    }

    /// Open watches with `starter`.
    #[must_use]
    pub fn with_watch_starter(mut self, starter: Arc<dyn WatchStarter>) -> Self {
        self.watch_starter = Some(starter);
        self
    }

    /// Set the provider registry.
    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Hand failed rollbacks to `sweeper`.
    #[must_use]
    pub fn with_sweeper(mut self, sweeper: Arc<dyn OrphanSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the worker count.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a collaborator is missing and
    /// [`Error::Core`] if the configuration is invalid.
    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;

        let desired = self
            .desired
            .ok_or_else(|| Error::invalid_config("desired store is required"))?;
        let status = self
            .status
            .ok_or_else(|| Error::invalid_config("status sink is required"))?;
        let observed = self
            .observed
            .ok_or_else(|| Error::invalid_config("observed store is required"))?;
        let providers = self
            .providers
            .ok_or_else(|| Error::invalid_config("provider registry is required"))?;

        let queue = WorkQueue::new(Box::new(controller_rate_limiter(&self.config)));

        let starter: Arc<dyn WatchStarter> = match (self.watch_starter, self.observed_events) {
            (Some(starter), _) => starter,
            (None, Some(store)) => Arc::new(StoreWatchStarter::new(store, queue.clone())),
            (None, None) => return Err(Error::invalid_config("watch starter is required")),
        };

        let workers = self.config.workers;
        let reconciler = Reconciler::new(
            desired,
            status,
            observed,
            providers,
            Arc::new(WatchManager::new(starter)),
            self.sweeper,
            self.config,
        );

        Ok(Controller {
            queue,
            reconciler: Arc::new(reconciler),
            shutdown: Shutdown::new(),
            workers,
        })
    }
}

/// Watches an [`InMemoryObservedStore`] and requeues the owner of every
/// changed object of the watched kind.
#[derive(Debug)]
pub struct StoreWatchStarter {
    store: Arc<InMemoryObservedStore>,
    queue: WorkQueue<ResourceKey>,
}

impl StoreWatchStarter {
    /// Create a starter feeding `queue`.
    #[must_use]
    pub fn new(store: Arc<InMemoryObservedStore>, queue: WorkQueue<ResourceKey>) -> Self {
        Self { store, queue }
    }
}

impl WatchStarter for StoreWatchStarter {
    fn start(&self, kind: &str) -> Result<Teardown> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::watch_failed(kind, e.to_string()))?;

        let mut events = self.store.subscribe();
        let store = Arc::clone(&self.store);
        let queue = self.queue.clone();
        let watched = kind.to_owned();
        let task = runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind == watched => {
                        if let Some(owner) = event.owner {
                            queue.add(owner);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(kind = %watched, missed, "watch lagged, requeueing every owner");
                        for owner in store.owners(&watched) {
                            queue.add(owner);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let abort = task.abort_handle();
        Ok(Box::new(move || abort.abort()))
    }
}
