//! Observable status of a reconciled resource.
//!
//! Conditions follow the usual controller convention: a typed, tri-state
//! record whose `last_transition_time` answers "how long has this resource
//! been in this state". [`ResourceStatus::set_condition`] only moves that
//! timestamp when the tri-state value actually flips.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known condition reasons.
pub mod reasons {
    /// Managed data was fetched and written.
    pub const SYNCED: &str = "Synced";
    /// The last attempt failed and will be retried or needs intervention.
    pub const SYNC_ERROR: &str = "SyncError";
    /// The resource spec cannot be reconciled as written.
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// Another worker holds the lock for the managed object.
    pub const LOCKED: &str = "Locked";
    /// The external system reports the source data no longer exists.
    pub const UPSTREAM_DELETED: &str = "UpstreamDeleted";
}

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition types reported by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// The managed object reflects the desired state.
    Ready,
    /// The managed object was removed as part of a deletion policy.
    Deleted,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A single status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a condition stamped with the current time.
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Override the transition time.
    #[must_use]
    pub const fn at(mut self, time: DateTime<Utc>) -> Self {
        self.last_transition_time = time;
        self
    }

    /// Whether two conditions carry the same observable content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Last-sync bookkeeping, mutated only after a successful provider fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBookkeeping {
    /// Resource version the managed data was produced from.
    pub synced_resource_version: Option<String>,
    /// When the managed data was last fetched.
    pub refresh_time: Option<DateTime<Utc>>,
}

impl SyncBookkeeping {
    /// True if no sync has ever completed.
    #[must_use]
    pub fn never_synced(&self) -> bool {
        self.synced_resource_version
            .as_deref()
            .map_or(true, str::is_empty)
            || self.refresh_time.is_none()
    }

    /// Record a successful sync.
    pub fn record(&mut self, version: impl Into<String>, now: DateTime<Utc>) {
        self.synced_resource_version = Some(version.into());
        self.refresh_time = Some(now);
    }
}

/// Persisted status of a reconciled resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub sync: SyncBookkeeping,
    /// Name of the managed object this resource is bound to.
    pub binding: Option<String>,
}

impl ResourceStatus {
    /// Look up a condition by type.
    #[must_use]
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// True if the `Ready` condition is `True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.condition(ConditionType::Ready)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Insert or replace a condition.
    ///
    /// Returns `false` without touching anything if status, reason, and
    /// message are all unchanged. If only reason or message changed the
    /// existing transition time is kept; only a tri-state flip takes the
    /// transition time of `new`.
    pub fn set_condition(&mut self, mut new: Condition) -> bool {
        if let Some(current) = self.condition(new.condition_type) {
            if current.same_content(&new) {
                return false;
            }
            if current.status == new.status {
                new.last_transition_time = current.last_transition_time;
            }
        }

        self.conditions
            .retain(|c| c.condition_type != new.condition_type);
        self.conditions.push(new);
        true
    }

    /// Remove a condition by type. Returns whether one was present.
    pub fn remove_condition(&mut self, condition_type: ConditionType) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.condition_type != condition_type);
        before != self.conditions.len()
    }
}
