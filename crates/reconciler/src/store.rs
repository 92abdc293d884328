//! Storage collaborators and their in-memory implementations.
//!
//! The reconciler only sees the traits. The in-memory stores keep optimistic
//! concurrency (a `revision` per object) and broadcast changes so they can
//! drive a [`Controller`](crate::controller::Controller) in tests or when
//! embedded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use converge_core::{ResourceKey, ResourceStatus};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};
use crate::resource::{ManagedObject, SyncedResource};

const CHANNEL_CAPACITY: usize = 1024;

/// Authoritative desired state.
#[async_trait]
pub trait DesiredStore: Send + Sync {
    /// Read the current object, `None` if it does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<SyncedResource>>;

    /// Write metadata and spec. Fails with [`Error::Conflict`] if
    /// `resource.meta.revision` is stale. Returns the stored object.
    async fn update(&self, resource: &SyncedResource) -> Result<SyncedResource>;

    /// Every stored key. Used to resync after change notifications were
    /// dropped.
    async fn keys(&self) -> Result<Vec<ResourceKey>>;
}

/// Where reconcile outcomes are reported.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Replace the status of `key`. Fails with [`Error::Conflict`] if
    /// `revision` is stale.
    async fn update_status(
        &self,
        key: &ResourceKey,
        revision: u64,
        status: &ResourceStatus,
    ) -> Result<()>;
}

/// The managed counterparts.
#[async_trait]
pub trait ObservedStore: Send + Sync {
    /// Read an object, `None` if it does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedObject>>;

    /// Create an object. Fails with [`Error::Conflict`] if it exists.
    async fn create(&self, object: &ManagedObject) -> Result<()>;

    /// Replace an object. Fails with [`Error::NotFound`] if it is missing.
    async fn update(&self, object: &ManagedObject) -> Result<()>;

    /// Delete an object. Deleting a missing object is not an error; returns
    /// whether something was removed.
    async fn delete(&self, key: &ResourceKey) -> Result<bool>;
}

/// In-memory [`DesiredStore`] and [`StatusSink`].
///
/// Spec and metadata writes bump `revision` and notify subscribers; status
/// writes bump `revision` silently, the way a status subresource does not
/// bump the generation. An object with `deletion_requested` and no
/// finalizers left is removed.
#[derive(Debug)]
pub struct InMemoryDesiredStore {
    objects: RwLock<HashMap<ResourceKey, SyncedResource>>,
    changes: broadcast::Sender<ResourceKey>,
}

impl Default for InMemoryDesiredStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDesiredStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create an empty store whose subscribers fall behind after `capacity`
    /// unread changes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            objects: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Receive the key of every object created, changed or removed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceKey> {
        self.changes.subscribe()
    }

    /// Create or replace an object as a user would. A replaced object gets a
    /// new generation if its spec changed. Returns the stored object.
    pub fn apply(&self, mut resource: SyncedResource) -> SyncedResource {
        let key = resource.key();
        let stored = {
            let mut objects = self.objects.write();
            if let Some(existing) = objects.get(&key) {
                resource.meta.revision = existing.meta.revision + 1;
                resource.meta.generation = if existing.spec == resource.spec {
                    existing.meta.generation
                } else {
                    existing.meta.generation + 1
                };
                resource.meta.finalizers.clone_from(&existing.meta.finalizers);
                resource.status = existing.status.clone();
            } else {
                resource.meta.revision = 1;
                resource.meta.generation = resource.meta.generation.max(1);
            }
            objects.insert(key.clone(), resource.clone());
            resource
        };
        self.notify(key);
        stored
    }

    /// Mark an object for deletion, removing it at once if nothing holds it.
    /// Returns false if the object does not exist.
    pub fn request_deletion(&self, key: &ResourceKey) -> bool {
        {
            let mut objects = self.objects.write();
            let Some(object) = objects.get_mut(key) else {
                return false;
            };
            object.meta.deletion_requested = true;
            object.meta.revision += 1;
            if object.meta.finalizers.is_empty() {
                objects.remove(key);
            }
        }
        self.notify(key.clone());
        true
    }

    /// Current copy of an object.
    #[must_use]
    pub fn snapshot(&self, key: &ResourceKey) -> Option<SyncedResource> {
        self.objects.read().get(key).cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn notify(&self, key: ResourceKey) {
        // No receivers is fine.
        let _ = self.changes.send(key);
    }
}

#[async_trait]
impl DesiredStore for InMemoryDesiredStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<SyncedResource>> {
        Ok(self.snapshot(key))
    }

    async fn update(&self, resource: &SyncedResource) -> Result<SyncedResource> {
        let key = resource.key();
        let stored = {
            let mut objects = self.objects.write();
            let existing = objects
                .get(&key)
                .ok_or_else(|| Error::not_found("resource", key.to_string()))?;
            if existing.meta.revision != resource.meta.revision {
                return Err(Error::conflict(key.to_string()));
            }

            let mut next = resource.clone();
            next.meta.revision += 1;
            next.status = existing.status.clone();
            if next.meta.deletion_requested && next.meta.finalizers.is_empty() {
                objects.remove(&key);
            } else {
                objects.insert(key.clone(), next.clone());
            }
            next
        };
        trace!(key = %key, revision = stored.meta.revision, "resource updated");
        self.notify(key);
        Ok(stored)
    }

    async fn keys(&self) -> Result<Vec<ResourceKey>> {
        Ok(self.objects.read().keys().cloned().collect())
    }
}

#[async_trait]
impl StatusSink for InMemoryDesiredStore {
    async fn update_status(
        &self,
        key: &ResourceKey,
        revision: u64,
        status: &ResourceStatus,
    ) -> Result<()> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found("resource", key.to_string()))?;
        if object.meta.revision != revision {
            return Err(Error::conflict(key.to_string()));
        }
        object.status = status.clone();
        object.meta.revision += 1;
        Ok(())
    }
}

/// A change to a managed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub kind: String,
    pub key: ResourceKey,
    pub owner: Option<ResourceKey>,
}

/// In-memory [`ObservedStore`].
#[derive(Debug)]
pub struct InMemoryObservedStore {
    objects: RwLock<HashMap<ResourceKey, ManagedObject>>,
    changes: broadcast::Sender<ObservedEvent>,
    fail_writes: AtomicBool,
}

impl Default for InMemoryObservedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObservedStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create an empty store whose subscribers fall behind after `capacity`
    /// unread changes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            objects: RwLock::new(HashMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Receive every change to every object.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ObservedEvent> {
        self.changes.subscribe()
    }

    /// Make `create` and `update` fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current copy of an object.
    #[must_use]
    pub fn snapshot(&self, key: &ResourceKey) -> Option<ManagedObject> {
        self.objects.read().get(key).cloned()
    }

    /// Insert an object directly, bypassing failure injection.
    pub fn insert(&self, object: ManagedObject) {
        let event = event_for(&object);
        self.objects.write().insert(object.key.clone(), object);
        self.notify(event);
    }

    /// Edit an object in place, as something other than the controller
    /// would. Returns false if it does not exist.
    pub fn modify<F>(&self, key: &ResourceKey, edit: F) -> bool
    where
        F: FnOnce(&mut ManagedObject),
    {
        let event = {
            let mut objects = self.objects.write();
            let Some(object) = objects.get_mut(key) else {
                return false;
            };
            edit(object);
            event_for(object)
        };
        self.notify(event);
        true
    }

    /// Owners of every object of `kind`, without duplicates.
    #[must_use]
    pub fn owners(&self, kind: &str) -> Vec<ResourceKey> {
        let mut owners: Vec<ResourceKey> = self
            .objects
            .read()
            .values()
            .filter(|o| o.kind == kind)
            .filter_map(|o| o.owner.clone())
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::store(operation, "writes are failing"));
        }
        Ok(())
    }

    fn notify(&self, event: ObservedEvent) {
        let _ = self.changes.send(event);
    }
}

fn event_for(object: &ManagedObject) -> ObservedEvent {
    ObservedEvent {
        kind: object.kind.clone(),
        key: object.key.clone(),
        owner: object.owner.clone(),
    }
}

#[async_trait]
impl ObservedStore for InMemoryObservedStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedObject>> {
        Ok(self.snapshot(key))
    }

    async fn create(&self, object: &ManagedObject) -> Result<()> {
        self.check_writable("create")?;
        {
            let mut objects = self.objects.write();
            if objects.contains_key(&object.key) {
                return Err(Error::conflict(object.key.to_string()));
            }
            objects.insert(object.key.clone(), object.clone());
        }
        self.notify(event_for(object));
        Ok(())
    }

    async fn update(&self, object: &ManagedObject) -> Result<()> {
        self.check_writable("update")?;
        {
            let mut objects = self.objects.write();
            let slot = objects
                .get_mut(&object.key)
                .ok_or_else(|| Error::not_found(&object.kind, object.key.to_string()))?;
            *slot = object.clone();
        }
        self.notify(event_for(object));
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        let removed = self.objects.write().remove(key);
        if let Some(object) = &removed {
            self.notify(event_for(object));
        }
        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::resource::{DataRef, ObjectMeta, SyncSpec, FINALIZER};

    fn resource(name: &str) -> SyncedResource {
        SyncedResource::new(
            ObjectMeta::new("default", name),
            SyncSpec {
                provider: "vault".into(),
                data: vec![DataRef::new("k", "path/k")],
                ..SyncSpec::default()
            },
        )
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = InMemoryDesiredStore::new();
        let stored = store.apply(resource("a"));

        let fresh = store.update(&stored).await.unwrap();
        assert_eq!(fresh.meta.revision, stored.meta.revision + 1);

        let stale = store.update(&stored).await;
        assert!(matches!(stale, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_status_write_checks_revision_and_keeps_generation() {
        let store = InMemoryDesiredStore::new();
        let stored = store.apply(resource("a"));
        let key = stored.key();

        store
            .update_status(&key, stored.meta.revision, &ResourceStatus::default())
            .await
            .unwrap();
        let conflict = store
            .update_status(&key, stored.meta.revision, &ResourceStatus::default())
            .await;
        assert!(matches!(conflict, Err(Error::Conflict { .. })));
        assert_eq!(store.snapshot(&key).unwrap().meta.generation, 1);
    }

    #[tokio::test]
    async fn test_apply_bumps_generation_only_on_spec_change() {
        let store = InMemoryDesiredStore::new();
        store.apply(resource("a"));
        let same = store.apply(resource("a"));
        assert_eq!(same.meta.generation, 1);

        let mut changed = resource("a");
        changed.spec.provider = "aws".into();
        assert_eq!(store.apply(changed).meta.generation, 2);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizers() {
        let store = InMemoryDesiredStore::new();
        let stored = store.apply(resource("a"));
        let mut with_finalizer = stored.clone();
        with_finalizer.meta.add_finalizer(FINALIZER);
        store.update(&with_finalizer).await.unwrap();

        assert!(store.request_deletion(&stored.key()));
        let pending = store.snapshot(&stored.key()).unwrap();
        assert!(pending.meta.deletion_requested);

        let mut released = pending;
        released.meta.remove_finalizer(FINALIZER);
        store.update(&released).await.unwrap();
        assert!(store.snapshot(&stored.key()).is_none());
    }

    #[tokio::test]
    async fn test_observed_store_create_update_delete() {
        let store = InMemoryObservedStore::new();
        let mut events = store.subscribe();
        let key = ResourceKey::new("default", "db");
        let mut obj = ManagedObject::new(key.clone(), "Secret");

        assert!(matches!(
            store.update(&obj).await,
            Err(Error::NotFound { .. })
        ));
        store.create(&obj).await.unwrap();
        assert!(matches!(
            store.create(&obj).await,
            Err(Error::Conflict { .. })
        ));

        obj.data.insert("k".into(), b"v".to_vec());
        store.update(&obj).await.unwrap();
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());

        assert_eq!(events.recv().await.unwrap().key, key);
    }

    #[tokio::test]
    async fn test_fail_writes_injects_store_errors() {
        let store = InMemoryObservedStore::new();
        store.set_fail_writes(true);
        let obj = ManagedObject::new(ResourceKey::new("default", "db"), "Secret");
        assert!(matches!(store.create(&obj).await, Err(Error::Store { .. })));
        store.set_fail_writes(false);
        assert!(store.create(&obj).await.is_ok());
    }

    #[tokio::test]
    async fn test_keys_lists_every_stored_resource() {
        let store = InMemoryDesiredStore::new();
        store.apply(resource("a"));
        store.apply(resource("b"));

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![ResourceKey::new("default", "a"), ResourceKey::new("default", "b")]
        );
    }

    #[test]
    fn test_owners_filters_by_kind_and_dedups() {
        let store = InMemoryObservedStore::new();
        let owner = ResourceKey::new("default", "sync");
        for (name, kind) in [("a", "Secret"), ("b", "Secret"), ("c", "ConfigMap")] {
            let mut obj = ManagedObject::new(ResourceKey::new("default", name), kind);
            obj.owner = Some(owner.clone());
            store.insert(obj);
        }
        store.insert(ManagedObject::new(ResourceKey::new("default", "orphan"), "Secret"));

        assert_eq!(store.owners("Secret"), vec![owner]);
        assert!(store.owners("Opaque").is_empty());
    }
}
