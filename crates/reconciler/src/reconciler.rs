//! The reconcile loop.
//!
//! One call to [`Reconciler::reconcile`] is one attempt for one key. It always
//! re-reads the desired object and its managed counterpart, so the outcome
//! depends only on current state and the persisted sync bookkeeping, never on
//! which event caused the call.
//!
//! Attempt flow:
//!
//! 1. read desired; gone means nothing to do
//! 2. deletion requested: run the finalizer path instead
//! 3. read observed and run the refresh gate; skip if nothing changed
//! 4. take the per-target lock, fetch from the provider, write through a
//!    [`StateManager`] so any failure rolls the partial write back
//! 5. write status if it changed, then tell the queue what to do next

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use converge_core::{
    reasons, Condition, ConditionStatus, ConditionType, ReconcileRequest, ResourceKey,
    ResourceStatus,
};
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, ErrorClass, FetchError, Result};
use crate::gate::{self, GateDecision, ManagedArtifactState};
use crate::lock::{KeyedLockManager, LockKey};
use crate::provider::{ExternalClient, FetchRequest, ProviderRegistry};
use crate::resource::{
    apply_sync, CreationPolicy, DeletionPolicy, ManagedObject, SyncedResource, FINALIZER,
};
use crate::shutdown::Shutdown;
use crate::store::{DesiredStore, ObservedStore, StatusSink};
use crate::transaction::{step, OrphanSweeper, StateManager};
use crate::watch::WatchManager;

const SYNCED_MESSAGE: &str = "managed object is in sync";

/// What the work queue should do with a key after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Done; reset backoff and wait for the next change.
    Forget,
    /// Done; reset backoff and come back after the delay.
    RequeueAfter(Duration),
    /// Failed; come back after the rate limiter's delay.
    RequeueRateLimited,
    /// Lost a write race; come back as soon as a worker is free, without
    /// touching backoff.
    Requeue,
}

/// Successful attempt outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Converged {
    Skipped {
        requeue_after: Option<Duration>,
    },
    Synced {
        version: String,
        binding: Option<String>,
    },
    UpstreamDeleted {
        deleted: bool,
        message: String,
    },
}

/// Converges synced resources toward their providers.
pub struct Reconciler {
    desired: Arc<dyn DesiredStore>,
    status: Arc<dyn StatusSink>,
    observed: Arc<dyn ObservedStore>,
    providers: ProviderRegistry,
    locks: KeyedLockManager,
    watches: Arc<WatchManager>,
    sweeper: Option<Arc<dyn OrphanSweeper>>,
    config: ControllerConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("providers", &self.providers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        desired: Arc<dyn DesiredStore>,
        status: Arc<dyn StatusSink>,
        observed: Arc<dyn ObservedStore>,
        providers: ProviderRegistry,
        watches: Arc<WatchManager>,
        sweeper: Option<Arc<dyn OrphanSweeper>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            desired,
            status,
            observed,
            providers,
            locks: KeyedLockManager::new(),
            watches,
            sweeper,
            config,
        }
    }

    /// The desired-state store attempts read from.
    #[must_use]
    pub fn desired(&self) -> &Arc<dyn DesiredStore> {
        &self.desired
    }

    /// The lock table shared by every attempt.
    #[must_use]
    pub fn locks(&self) -> &KeyedLockManager {
        &self.locks
    }

    /// The watch table shared by every attempt.
    #[must_use]
    pub fn watches(&self) -> &Arc<WatchManager> {
        &self.watches
    }

    /// Run one attempt for `request`.
    #[instrument(skip_all, fields(key = %request.key))]
    pub async fn reconcile(&self, request: &ReconcileRequest, shutdown: &Shutdown) -> Action {
        let resource = match self.desired.get(&request.key).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                debug!("resource no longer exists");
                return Action::Forget;
            }
            Err(e) => {
                warn!(error = %e, "failed to read resource");
                return Action::RequeueRateLimited;
            }
        };

        if resource.meta.deletion_requested {
            return self.finalize(resource).await;
        }

        let resource = match self.ensure_finalizer(resource).await {
            Ok(resource) => resource,
            Err(e) => {
                debug!(error = %e, "failed to add finalizer");
                return Action::RequeueRateLimited;
            }
        };

        // Whatever happens inside, including a panic, status is written below.
        let outcome = AssertUnwindSafe(self.converge(&resource, shutdown))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(Error::Aborted {
                    reason: panic_reason(payload.as_ref()),
                })
            });

        let mut status = resource.status.clone();
        let action = self.record_outcome(&resource, &mut status, outcome);
        self.flush_status(&resource, &status, action).await
    }

    async fn ensure_finalizer(&self, resource: SyncedResource) -> Result<SyncedResource> {
        if resource.meta.has_finalizer(FINALIZER) {
            return Ok(resource);
        }
        let mut updated = resource;
        updated.meta.add_finalizer(FINALIZER);
        self.desired.update(&updated).await
    }

    /// Deletion path: apply the deletion policy, drop our watch reference,
    /// and let the resource go.
    async fn finalize(&self, resource: SyncedResource) -> Action {
        if !resource.meta.has_finalizer(FINALIZER) {
            return Action::Forget;
        }
        let key = resource.key();
        let target = resource.target_key();

        if resource.spec.target.deletion_policy == DeletionPolicy::Delete {
            if let Err(e) = self.delete_if_owned(&key, &target).await {
                warn!(error = %e, target = %target, "failed to delete managed object");
                return Action::RequeueRateLimited;
            }
        }
        self.watches.release(&resource.spec.target.kind, &key).await;

        let mut released = resource;
        released.meta.remove_finalizer(FINALIZER);
        match self.desired.update(&released).await {
            Ok(_) | Err(Error::NotFound { .. }) => {
                info!("resource finalized");
                Action::Forget
            }
            Err(e) => {
                debug!(error = %e, "failed to remove finalizer");
                Action::RequeueRateLimited
            }
        }
    }

    async fn delete_if_owned(&self, owner: &ResourceKey, target: &ResourceKey) -> Result<bool> {
        match self.observed.get(target).await? {
            Some(object) if object.is_owned_by(owner) => self.observed.delete(target).await,
            _ => Ok(false),
        }
    }

    async fn converge(&self, resource: &SyncedResource, shutdown: &Shutdown) -> Result<Converged> {
        resource.validate()?;

        let key = resource.key();
        let target_key = resource.target_key();
        let target = &resource.spec.target;
        let version = resource.resource_version();
        let refresh = &resource.spec.refresh;
        let bookkeeping = &resource.status.sync;
        let now = Utc::now();

        let existing = self.observed.get(&target_key).await?;

        let decision = if target.creation_policy == CreationPolicy::None {
            // Nothing is written, so there is nothing to validate.
            if gate::should_refresh(refresh, bookkeeping, &version, now) {
                GateDecision::Refresh
            } else {
                GateDecision::Skip {
                    requeue_after: gate::remaining_interval(refresh, bookkeeping, now),
                }
            }
        } else {
            let state = existing
                .as_ref()
                .map_or_else(ManagedArtifactState::absent, ManagedObject::artifact_state);
            let expected = existing.as_ref().and_then(ManagedObject::recorded_fingerprint);
            gate::evaluate(refresh, bookkeeping, &version, &state, expected, now)
        };
        if let GateDecision::Skip { requeue_after } = decision {
            debug!("refresh not needed");
            return Ok(Converged::Skipped { requeue_after });
        }

        match (&existing, target.creation_policy) {
            (Some(object), CreationPolicy::Owner) => {
                if let Some(owner) = object.owner.as_ref().filter(|o| **o != key) {
                    return Err(Error::OwnershipConflict {
                        key: target_key.to_string(),
                        owner: owner.to_string(),
                    });
                }
            }
            (None, CreationPolicy::Merge) => {
                return Err(Error::not_found(&target.kind, target_key.to_string()));
            }
            _ => {}
        }

        let provider_name = resource.spec.provider.clone();
        let mut lock = self.locks.try_acquire(&LockKey::new([
            provider_name.as_str(),
            target_key.namespace(),
            target_key.name(),
        ]))?;

        let client = self
            .providers
            .get(&provider_name)?
            .client(resource)
            .await
            .map_err(|e| Error::fetch(&provider_name, e))?;

        let result = self
            .sync_with(resource, existing, &client, &provider_name, version, shutdown)
            .await;

        if let Err(e) = client.close().await {
            debug!(error = %e, "failed to close provider client");
        }
        lock.release();
        result
    }

    async fn sync_with(
        &self,
        resource: &SyncedResource,
        existing: Option<ManagedObject>,
        client: &Arc<dyn ExternalClient>,
        provider_name: &str,
        version: String,
        shutdown: &Shutdown,
    ) -> Result<Converged> {
        let key = resource.key();
        let target_key = resource.target_key();
        let target = &resource.spec.target;

        let request = FetchRequest::for_resource(resource);
        let fetched = tokio::select! {
            biased;
            () = shutdown.cancelled() => Err(FetchError::Cancelled),
            fetched = client.fetch(&request) => fetched,
        };
        let data = match fetched.map_err(|e| Error::fetch(provider_name, e)) {
            Ok(data) => data,
            Err(e) if e.is_not_found_upstream() => {
                return self.handle_upstream_deleted(resource, e).await;
            }
            Err(e) => return Err(e),
        };

        let mut tx = StateManager::new();
        {
            let (commit_client, rollback_client) = (Arc::clone(client), Arc::clone(client));
            let (commit_key, rollback_key) = (key.clone(), key.clone());
            let (commit_name, rollback_name) = (provider_name.to_owned(), provider_name.to_owned());
            tx.enqueue(
                "provider",
                Some(step(move || async move {
                    commit_client
                        .commit(&commit_key)
                        .await
                        .map_err(|e| Error::fetch(commit_name, e))
                })),
                Some(step(move || async move {
                    rollback_client
                        .rollback(&rollback_key)
                        .await
                        .map_err(|e| Error::fetch(rollback_name, e))
                })),
            );
        }

        if target.creation_policy == CreationPolicy::None {
            return self.commit(&mut tx, version, None).await;
        }

        let mut object = existing
            .clone()
            .unwrap_or_else(|| ManagedObject::new(target_key.clone(), &target.kind));
        let written = apply_sync(&mut object, resource, data);

        let observed = Arc::clone(&self.observed);
        let undo_key = target_key.clone();
        let previous = existing.clone();
        tx.enqueue(
            "managed-object",
            None,
            Some(step(move || async move {
                match previous {
                    Some(previous) => observed.update(&previous).await,
                    None => observed.delete(&undo_key).await.map(|_| ()),
                }
            })),
        );
        let write = if existing.is_some() {
            self.observed.update(&object).await
        } else {
            self.observed.create(&object).await
        };
        if let Err(e) = write {
            return Err(self.abort(&mut tx, e).await);
        }

        let newly_referenced = !self.watches.is_referenced(&target.kind, &key).await;
        if newly_referenced {
            let watches = Arc::clone(&self.watches);
            let (kind, referrer) = (target.kind.clone(), key.clone());
            tx.enqueue(
                "watch",
                None,
                Some(step(move || async move {
                    watches.release(&kind, &referrer).await;
                    Ok(())
                })),
            );
        }
        if let Err(e) = self.watches.ensure(&target.kind, &key).await {
            return Err(self.abort(&mut tx, e).await);
        }

        if let Err(e) = self.verify(&target_key, &written).await {
            return Err(self.abort(&mut tx, e).await);
        }

        self.commit(&mut tx, version, Some(target_key.name().to_owned()))
            .await
    }

    async fn commit(
        &self,
        tx: &mut StateManager,
        version: String,
        binding: Option<String>,
    ) -> Result<Converged> {
        if let Err(joined) = tx.commit_all().await {
            return Err(self.abort(tx, Error::Commit(joined)).await);
        }
        Ok(Converged::Synced { version, binding })
    }

    /// Read back what was just written.
    async fn verify(&self, target_key: &ResourceKey, expected: &str) -> Result<()> {
        let object = self
            .observed
            .get(target_key)
            .await?
            .ok_or_else(|| Error::verification_failed(target_key.to_string(), "object missing"))?;
        let state = object.artifact_state();
        if !gate::is_managed_state_valid(&state, Some(expected)) {
            return Err(Error::verification_failed(
                target_key.to_string(),
                "fingerprint mismatch",
            ));
        }
        Ok(())
    }

    async fn abort(&self, tx: &mut StateManager, cause: Error) -> Error {
        let rollback = tx.rollback_all(self.sweeper.as_deref()).await.err();
        if let Some(rollback) = &rollback {
            warn!(error = %rollback, "rollback incomplete");
        }
        Error::RolledBack {
            cause: Box::new(cause),
            rollback,
        }
    }

    async fn handle_upstream_deleted(
        &self,
        resource: &SyncedResource,
        cause: Error,
    ) -> Result<Converged> {
        let key = resource.key();
        let target_key = resource.target_key();
        let deleted = match resource.spec.target.deletion_policy {
            DeletionPolicy::Delete => self.delete_if_owned(&key, &target_key).await?,
            DeletionPolicy::Retain => false,
        };
        info!(deleted, "source data deleted upstream");
        Ok(Converged::UpstreamDeleted {
            deleted,
            message: cause.to_string(),
        })
    }

    /// Map the outcome onto `status` and decide the queue action.
    fn record_outcome(
        &self,
        resource: &SyncedResource,
        status: &mut ResourceStatus,
        outcome: Result<Converged>,
    ) -> Action {
        let interval = resource.spec.refresh.interval;
        let after_interval = || {
            if interval.is_zero() {
                Action::Forget
            } else {
                Action::RequeueAfter(interval)
            }
        };

        match outcome {
            Ok(Converged::Skipped { requeue_after }) => {
                requeue_after.map_or(Action::Forget, Action::RequeueAfter)
            }
            Ok(Converged::Synced { version, binding }) => {
                status.sync.record(version, Utc::now());
                status.binding = binding;
                status.set_condition(ready(ConditionStatus::True, reasons::SYNCED, SYNCED_MESSAGE));
                status.remove_condition(ConditionType::Deleted);
                info!("synced");
                after_interval()
            }
            Ok(Converged::UpstreamDeleted { deleted, message }) => {
                status.set_condition(ready(
                    ConditionStatus::False,
                    reasons::UPSTREAM_DELETED,
                    message,
                ));
                if deleted {
                    status.binding = None;
                    status.set_condition(Condition::new(
                        ConditionType::Deleted,
                        ConditionStatus::True,
                        reasons::UPSTREAM_DELETED,
                        "managed object deleted",
                    ));
                }
                after_interval()
            }
            Err(e) => {
                let reason = match &e {
                    Error::LockConflict { .. } => reasons::LOCKED,
                    Error::InvalidSpec { .. } => reasons::INVALID_SPEC,
                    _ => reasons::SYNC_ERROR,
                };
                status.set_condition(ready(ConditionStatus::False, reason, e.to_string()));
                match e.class(self.config.auth_failure_policy) {
                    ErrorClass::Permanent => {
                        warn!(error = %e, "reconcile failed permanently");
                        Action::Forget
                    }
                    ErrorClass::Transient => {
                        debug!(error = %e, "reconcile failed, will retry");
                        Action::RequeueRateLimited
                    }
                }
            }
        }
    }

    async fn flush_status(
        &self,
        resource: &SyncedResource,
        status: &ResourceStatus,
        action: Action,
    ) -> Action {
        if *status == resource.status {
            return action;
        }
        match self
            .status
            .update_status(&resource.key(), resource.meta.revision, status)
            .await
        {
            Ok(()) => action,
            Err(e) if e.is_conflict() => {
                debug!("status update conflicted, requeueing");
                Action::Requeue
            }
            Err(Error::NotFound { .. }) => Action::Forget,
            Err(e) => {
                warn!(error = %e, "failed to update status");
                Action::RequeueRateLimited
            }
        }
    }
}

fn ready(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(ConditionType::Ready, status, reason, message)
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic during reconcile".to_owned())
}
