//! Desired and managed resource model.
//!
//! A [`SyncedResource`] declares which provider data should be copied into
//! which managed object. The managed counterpart is a [`ManagedObject`]; every
//! write to it goes through [`apply_sync`] so the managed marker, the
//! data fingerprint and the owner reference are always stamped the same way.

use std::collections::{BTreeMap, HashSet};

use converge_core::{ResourceKey, ResourceStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::gate::{ManagedArtifactState, RefreshConfig};

/// Label marking an object as written by this controller.
pub const MANAGED_LABEL: &str = "converge.io/managed";

/// Annotation holding the fingerprint of the data last written.
pub const DATA_HASH_ANNOTATION: &str = "converge.io/data-hash";

/// Finalizer added to every live resource.
pub const FINALIZER: &str = "converge.io/finalizer";

/// Kind used when a target does not name one.
pub const DEFAULT_TARGET_KIND: &str = "Secret";

/// Managed data, keyed by target key.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// How the managed object is created and owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreationPolicy {
    /// Create the object and own it.
    #[default]
    Owner,
    /// Only merge into an object that already exists.
    Merge,
    /// Create or update without claiming ownership.
    Orphan,
    /// Fetch only; write nothing.
    None,
}

/// What happens to the managed object when its source goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeletionPolicy {
    #[default]
    Retain,
    Delete,
}

fn default_kind() -> String {
    DEFAULT_TARGET_KIND.to_owned()
}

/// The managed object a resource writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Defaults to the resource's own name when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub creation_policy: CreationPolicy,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: default_kind(),
            creation_policy: CreationPolicy::default(),
            deletion_policy: DeletionPolicy::default(),
        }
    }
}

/// One provider value copied into one target key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRef {
    /// Defaults to `remote_key` when empty.
    #[serde(default)]
    pub target_key: String,
    pub remote_key: String,
}

impl DataRef {
    /// Create a reference.
    pub fn new(target_key: impl Into<String>, remote_key: impl Into<String>) -> Self {
        Self {
            target_key: target_key.into(),
            remote_key: remote_key.into(),
        }
    }

    /// The key written into the managed object.
    #[must_use]
    pub fn effective_target_key(&self) -> &str {
        if self.target_key.is_empty() {
            &self.remote_key
        } else {
            &self.target_key
        }
    }
}

/// Desired state of a synced resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Name of the registered provider to fetch from.
    pub provider: String,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub target: TargetSpec,
    #[serde(default)]
    pub data: Vec<DataRef>,
}

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Bumped on every spec change.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Store revision used for optimistic concurrency.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default)]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    /// Metadata for `namespace/name` at generation 1.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generation: 1,
            ..Self::default()
        }
    }

    /// True if `finalizer` is present.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add `finalizer` if missing. Returns whether anything changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_owned());
        true
    }

    /// Remove `finalizer`. Returns whether anything changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

/// A resource whose managed object is kept in sync with a provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncedResource {
    pub meta: ObjectMeta,
    pub spec: SyncSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl SyncedResource {
    /// Create a resource with default status.
    #[must_use]
    pub fn new(meta: ObjectMeta, spec: SyncSpec) -> Self {
        Self {
            meta,
            spec,
            status: ResourceStatus::default(),
        }
    }

    /// Queue key of this resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.meta.namespace, &self.meta.name)
    }

    /// Name of the managed object.
    #[must_use]
    pub fn target_name(&self) -> &str {
        if self.spec.target.name.is_empty() {
            &self.meta.name
        } else {
            &self.spec.target.name
        }
    }

    /// Key of the managed object.
    #[must_use]
    pub fn target_key(&self) -> ResourceKey {
        ResourceKey::new(&self.meta.namespace, self.target_name())
    }

    /// Version string the sync bookkeeping is compared against.
    #[must_use]
    pub fn resource_version(&self) -> String {
        resource_version(&self.meta)
    }

    /// Check `spec`, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpec`] listing each violation.
    pub fn validate(&self) -> Result<()> {
        let spec = &self.spec;
        let mut reasons = Vec::new();

        if spec.provider.trim().is_empty() {
            reasons.push("provider is required".to_owned());
        }
        if spec.target.kind.trim().is_empty() {
            reasons.push("target.kind must not be empty".to_owned());
        }
        if spec.data.is_empty() {
            reasons.push("at least one data reference must be specified".to_owned());
        }
        if spec.target.deletion_policy == DeletionPolicy::Delete
            && spec.target.creation_policy != CreationPolicy::Owner
        {
            reasons.push(format!(
                "deletionPolicy=Delete requires creationPolicy=Owner, got {:?}",
                spec.target.creation_policy
            ));
        }

        let mut seen = HashSet::new();
        for (i, data) in spec.data.iter().enumerate() {
            if data.remote_key.is_empty() {
                reasons.push(format!("data[{i}]: remoteKey is required"));
                continue;
            }
            let target = data.effective_target_key();
            if !seen.insert(target) {
                reasons.push(format!("duplicate target key: {target}"));
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_spec(self.key().to_string(), reasons))
        }
    }
}

/// The managed counterpart of a [`SyncedResource`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManagedObject {
    pub key: ResourceKey,
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub data: SecretData,
    /// Resource that owns this object, if any.
    #[serde(default)]
    pub owner: Option<ResourceKey>,
}

impl ManagedObject {
    /// An empty object.
    pub fn new(key: ResourceKey, kind: impl Into<String>) -> Self {
        Self {
            key,
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// True if the managed marker label is set.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.labels.get(MANAGED_LABEL).is_some_and(|v| v == "true")
    }

    /// Fingerprint recorded when the object was last written.
    #[must_use]
    pub fn recorded_fingerprint(&self) -> Option<&str> {
        self.annotations.get(DATA_HASH_ANNOTATION).map(String::as_str)
    }

    /// Gate input: the fingerprint is computed from the data actually present,
    /// so direct edits to the data show up as a mismatch against
    /// [`recorded_fingerprint`](Self::recorded_fingerprint).
    #[must_use]
    pub fn artifact_state(&self) -> ManagedArtifactState {
        ManagedArtifactState {
            exists: true,
            managed: self.is_managed(),
            fingerprint: Some(fingerprint(&self.data)),
        }
    }

    /// True if `key` owns this object.
    #[must_use]
    pub fn is_owned_by(&self, key: &ResourceKey) -> bool {
        self.owner.as_ref() == Some(key)
    }
}

/// Lowercase hex SHA-256 over `data` in key order.
#[must_use]
pub fn fingerprint(data: &SecretData) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())
}

/// `"{generation}-{hash}"` where the hash covers labels and annotations, so
/// metadata-only edits also produce a new version.
#[must_use]
pub fn resource_version(meta: &ObjectMeta) -> String {
    #[derive(Serialize)]
    struct HashedMeta<'a> {
        annotations: &'a BTreeMap<String, String>,
        labels: &'a BTreeMap<String, String>,
    }

    let encoded = serde_json::to_vec(&HashedMeta {
        annotations: &meta.annotations,
        labels: &meta.labels,
    })
    .unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(&encoded));
    format!("{}-{}", meta.generation, &digest[..8])
}

/// Write fetched `data` into `object` and stamp it as managed by `resource`.
///
/// Existing keys not present in `data` are kept. Returns the new fingerprint.
pub fn apply_sync(object: &mut ManagedObject, resource: &SyncedResource, data: SecretData) -> String {
    object.data.extend(data);
    if resource.spec.target.creation_policy == CreationPolicy::Owner {
        object.owner = Some(resource.key());
    }

    let hash = fingerprint(&object.data);
    object
        .labels
        .insert(MANAGED_LABEL.to_owned(), "true".to_owned());
    object
        .annotations
        .insert(DATA_HASH_ANNOTATION.to_owned(), hash.clone());
    hash
}
