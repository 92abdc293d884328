//! Non-blocking per-key locks.
//!
//! Two resources that manage the same target through the same provider must
//! not write concurrently, even though the work queue only serializes per
//! resource. [`KeyedLockManager::try_acquire`] never waits: a held lock is
//! reported as [`Error::LockConflict`] so the caller can requeue.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{Error, Result};

/// Composite lock key, e.g. `provider#namespace#target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(String);

impl LockKey {
    /// Join `parts` with `#`.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join("#");
        Self(joined)
    }

    /// The joined key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out exclusive, non-blocking locks keyed by [`LockKey`].
///
/// Entries live for the life of the manager; the key space is bounded by the
/// live resources.
#[derive(Debug, Default)]
pub struct KeyedLockManager {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl KeyedLockManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `key` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockConflict`] if another holder has the lock.
    pub fn try_acquire(&self, key: &LockKey) -> Result<KeyLockGuard> {
        // Clone the handle out so the shard lock is not held while locking.
        let mutex = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let guard = mutex
            .try_lock_owned()
            .map_err(|_| Error::lock_conflict(key.as_str()))?;

        trace!(key = %key, "lock acquired");
        Ok(KeyLockGuard {
            key: key.clone(),
            guard: Some(guard),
        })
    }

    /// True if `key` is currently held.
    #[must_use]
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.locks
            .get(key)
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Number of keys ever locked.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

/// Holds a key's lock until released or dropped.
#[derive(Debug)]
pub struct KeyLockGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLockGuard {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Release the lock. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if self.guard.take().is_some() {
            trace!(key = %self.key, "lock released");
        }
    }

    /// True until [`release`](Self::release) is called.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
