//! Shared change-stream watches, reference counted by referencing resource.
//!
//! One watch per managed kind is started on first use and torn down when the
//! last resource referencing it lets go. References are a set keyed by the
//! referencing resource, so a retried attempt that calls [`WatchManager::ensure`]
//! twice is still counted once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use converge_core::ResourceKey;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;

/// Stops a watch. Runs exactly once.
pub type Teardown = Box<dyn FnOnce() + Send + Sync>;

/// Starts the underlying change stream for a kind.
pub trait WatchStarter: Send + Sync {
    /// Start watching `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WatchFailed`] if the stream cannot be opened.
    fn start(&self, kind: &str) -> Result<Teardown>;
}

struct WatchEntry {
    teardown: Option<Teardown>,
    referrers: HashSet<ResourceKey>,
}

/// Reference-counted table of active watches.
pub struct WatchManager {
    starter: Arc<dyn WatchStarter>,
    watches: RwLock<HashMap<String, WatchEntry>>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager").finish_non_exhaustive()
    }
}

impl WatchManager {
    /// Create a manager that opens watches through `starter`.
    #[must_use]
    pub fn new(starter: Arc<dyn WatchStarter>) -> Self {
        Self {
            starter,
            watches: RwLock::new(HashMap::new()),
        }
    }

    /// Register `referrer` as interested in `kind`, starting the watch if
    /// this is the first reference. Returns whether a watch was started.
    ///
    /// # Errors
    ///
    /// Propagates the starter's error; no entry is recorded in that case.
    pub async fn ensure(&self, kind: &str, referrer: &ResourceKey) -> Result<bool> {
        let mut watches = self.watches.write().await;

        if let Some(entry) = watches.get_mut(kind) {
            entry.referrers.insert(referrer.clone());
            debug!(kind, referrer = %referrer, users = entry.referrers.len(), "watch reused");
            return Ok(false);
        }

        let teardown = self.starter.start(kind)?;
        watches.insert(
            kind.to_owned(),
            WatchEntry {
                teardown: Some(teardown),
                referrers: HashSet::from([referrer.clone()]),
            },
        );
        info!(kind, referrer = %referrer, "watch started");
        Ok(true)
    }

    /// Drop `referrer`'s interest in `kind`. Tears the watch down when no
    /// referrers remain and returns whether that happened.
    ///
    /// Unknown kinds and referrers are ignored.
    pub async fn release(&self, kind: &str, referrer: &ResourceKey) -> bool {
        let mut watches = self.watches.write().await;

        let Some(entry) = watches.get_mut(kind) else {
            return false;
        };
        entry.referrers.remove(referrer);
        if !entry.referrers.is_empty() {
            return false;
        }

        let teardown = watches.remove(kind).and_then(|mut e| e.teardown.take());
        drop(watches);
        if let Some(teardown) = teardown {
            teardown();
            info!(kind, "watch torn down");
        }
        true
    }

    /// True if a watch for `kind` is running.
    pub async fn is_watched(&self, kind: &str) -> bool {
        self.watches.read().await.contains_key(kind)
    }

    /// True if `referrer` holds a reference on `kind`.
    pub async fn is_referenced(&self, kind: &str, referrer: &ResourceKey) -> bool {
        self.watches
            .read()
            .await
            .get(kind)
            .is_some_and(|e| e.referrers.contains(referrer))
    }

    /// Number of referrers on `kind`.
    pub async fn referrers(&self, kind: &str) -> usize {
        self.watches
            .read()
            .await
            .get(kind)
            .map_or(0, |e| e.referrers.len())
    }
}
