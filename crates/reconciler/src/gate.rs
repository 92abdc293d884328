//! Refresh gating: decide whether a reconcile needs to call the provider.
//!
//! Everything here is pure. The provider is skipped only when
//! [`should_refresh`] says no AND [`is_managed_state_valid`] says the managed
//! object is intact; a missing, unmarked, or tampered object always forces a
//! refresh regardless of policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use converge_core::SyncBookkeeping;
use serde::{Deserialize, Serialize};

/// When managed data should be re-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefreshPolicy {
    /// On a timer and whenever the resource version changes.
    #[default]
    Periodic,
    /// Only when the resource version changes.
    OnChange,
    /// Exactly once.
    CreatedOnce,
}

/// Refresh policy plus interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub policy: RefreshPolicy,
    /// Zero disables timed refreshes once the first sync has happened.
    pub interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            policy: RefreshPolicy::Periodic,
            interval: Duration::from_secs(3600),
        }
    }
}

impl RefreshConfig {
    /// Create a config.
    #[must_use]
    pub const fn new(policy: RefreshPolicy, interval: Duration) -> Self {
        Self { policy, interval }
    }
}

/// What the reconciler knows about the managed counterpart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedArtifactState {
    pub exists: bool,
    /// Carries the managed-by marker label.
    pub managed: bool,
    /// Fingerprint recorded on the object when it was last written.
    pub fingerprint: Option<String>,
}

impl ManagedArtifactState {
    /// State of an object that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }
}

/// Outcome of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// No provider call needed. Check again after `requeue_after`, if set.
    Skip { requeue_after: Option<Duration> },
    /// Fetch and write.
    Refresh,
}

fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // A refresh time in the future (clock skew) counts as just refreshed.
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Whether the refresh policy asks for a provider call.
#[must_use]
pub fn should_refresh(
    config: &RefreshConfig,
    bookkeeping: &SyncBookkeeping,
    current_version: &str,
    now: DateTime<Utc>,
) -> bool {
    let synced_version = bookkeeping.synced_resource_version.as_deref();

    match config.policy {
        RefreshPolicy::CreatedOnce => bookkeeping.never_synced(),
        RefreshPolicy::OnChange => {
            bookkeeping.never_synced() || synced_version != Some(current_version)
        }
        RefreshPolicy::Periodic => {
            let has_synced = synced_version.is_some_and(|v| !v.is_empty());
            if config.interval.is_zero() && has_synced {
                return false;
            }
            if synced_version != Some(current_version) {
                return true;
            }
            bookkeeping
                .refresh_time
                .map_or(true, |t| elapsed_since(t, now) >= config.interval)
        }
    }
}

/// Whether the managed object is intact: it exists, carries the managed
/// marker, and its fingerprint equals `expected`.
#[must_use]
pub fn is_managed_state_valid(state: &ManagedArtifactState, expected: Option<&str>) -> bool {
    if !state.exists || !state.managed {
        return false;
    }
    match (state.fingerprint.as_deref(), expected) {
        (Some(actual), Some(expected)) => actual == expected,
        _ => false,
    }
}

/// Time left until the next timed refresh.
///
/// Returns `None` when timed refreshes are disabled. Once the interval has
/// fully elapsed the whole interval is returned again.
#[must_use]
pub fn remaining_interval(
    config: &RefreshConfig,
    bookkeeping: &SyncBookkeeping,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if config.interval.is_zero() {
        return None;
    }
    let remaining = bookkeeping
        .refresh_time
        .map(|t| config.interval.saturating_sub(elapsed_since(t, now)))
        .filter(|d| !d.is_zero())
        .unwrap_or(config.interval);
    Some(remaining)
}

/// Combine both checks into a decision.
#[must_use]
pub fn evaluate(
    config: &RefreshConfig,
    bookkeeping: &SyncBookkeeping,
    current_version: &str,
    state: &ManagedArtifactState,
    expected_fingerprint: Option<&str>,
    now: DateTime<Utc>,
) -> GateDecision {
    if !should_refresh(config, bookkeeping, current_version, now)
        && is_managed_state_valid(state, expected_fingerprint)
    {
        GateDecision::Skip {
            requeue_after: remaining_interval(config, bookkeeping, now),
        }
    } else {
        GateDecision::Refresh
    }
}
