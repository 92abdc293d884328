//! Commit/rollback bookkeeping for one reconcile attempt.
//!
//! Side effects run eagerly; each one queues a commit that finalizes it and a
//! rollback that undoes it. On success every commit runs, on failure every
//! rollback runs, newest first. Both kinds of step must be idempotent: a
//! rollback for something that was never created is a no-op, not an error.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, JoinedError, Result};

/// A deferred async action.
pub type Step = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Wrap an async closure as a [`Step`].
pub fn step<F, Fut>(f: F) -> Step
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

struct QueueItem {
    label: String,
    commit: Option<Step>,
    rollback: Option<Step>,
}

/// Ordered commit/rollback pairs for one attempt.
#[derive(Default)]
pub struct StateManager {
    items: Vec<QueueItem>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field(
                "items",
                &self.items.iter().map(|i| i.label.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl StateManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a step. Either half may be absent.
    pub fn enqueue(
        &mut self,
        label: impl Into<String>,
        commit: Option<Step>,
        rollback: Option<Step>,
    ) {
        self.items.push(QueueItem {
            label: label.into(),
            commit,
            rollback,
        });
    }

    /// Number of queued steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run every pending commit in enqueue order.
    ///
    /// Every commit is attempted; each runs at most once. Rollbacks stay
    /// queued so a failed commit can still be undone.
    ///
    /// # Errors
    ///
    /// Returns every commit failure, joined.
    pub async fn commit_all(&mut self) -> std::result::Result<(), JoinedError> {
        let mut errors = JoinedError::new();
        for item in &mut self.items {
            if let Some(commit) = item.commit.take() {
                if let Err(e) = commit().await {
                    errors.push(e);
                }
            }
        }
        errors.into_result()
    }

    /// Run every pending rollback, newest first.
    ///
    /// A failing rollback does not stop the others. Each failure is handed to
    /// `sweeper`, when given, for eventual cleanup.
    ///
    /// # Errors
    ///
    /// Returns every rollback failure, joined.
    pub async fn rollback_all(
        &mut self,
        sweeper: Option<&dyn OrphanSweeper>,
    ) -> std::result::Result<(), JoinedError> {
        let mut errors = JoinedError::new();
        for item in self.items.iter_mut().rev() {
            item.commit = None;
            if let Some(rollback) = item.rollback.take() {
                if let Err(e) = rollback().await {
                    warn!(step = %item.label, error = %e, "rollback step failed");
                    if let Some(sweeper) = sweeper {
                        sweeper.schedule(&item.label, &e);
                    }
                    errors.push(e);
                }
            }
        }
        errors.into_result()
    }
}

/// Receives side effects that could not be rolled back immediately.
pub trait OrphanSweeper: Send + Sync {
    /// Record that `step` failed to roll back with `error`.
    fn schedule(&self, step: &str, error: &Error);
}

/// A leftover side effect awaiting garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepItem {
    pub step: String,
    pub reason: String,
    pub scheduled_at: DateTime<Utc>,
}

/// In-memory [`OrphanSweeper`] that records items for a later pass.
#[derive(Debug, Default)]
pub struct SweepQueue {
    items: Mutex<Vec<SweepItem>>,
}

impl SweepQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items awaiting a sweep.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.items.lock().len()
    }

    /// Take every recorded item.
    pub fn drain(&self) -> Vec<SweepItem> {
        std::mem::take(&mut *self.items.lock())
    }
}

impl OrphanSweeper for SweepQueue {
    fn schedule(&self, step: &str, error: &Error) {
        warn!(step, error = %error, "scheduling orphan sweep");
        self.items.lock().push(SweepItem {
            step: step.to_owned(),
            reason: error.to_string(),
            scheduled_at: Utc::now(),
        });
    }
}
