//! Deduplicating work queue with at-most-one-in-flight per key.
//!
//! A key moves through three sets:
//!
//! - `dirty`: needs processing (pending, or re-added while processing)
//! - `queue`: ready to be handed to a worker, always a subset of `dirty`
//! - `processing`: currently held by exactly one worker
//!
//! A key is in `queue` only when it is dirty and not processing. Adding a key
//! that is processing only marks it dirty; [`WorkQueue::done`] moves it back
//! into `queue`. N adds during one in-flight window therefore produce exactly
//! one follow-up dequeue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::rate_limiter::RateLimiter;

/// Where a key currently sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for a worker.
    Pending,
    /// Held by a worker.
    Processing,
    /// Held by a worker and re-added since; will be requeued on `done`.
    DirtyWhileProcessing,
    /// Scheduled by `add_after` and not yet added.
    Waiting,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

/// Rate-limited, deduplicating work queue.
///
/// Cloning is cheap; clones share the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("waiting", &state.waiting.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty queue using `limiter` for `add_rate_limited`.
    #[must_use]
    pub fn new(limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    /// Mark `key` as needing processing.
    ///
    /// No-op if the key is already pending. If the key is being processed it
    /// is marked dirty and requeued when the worker calls [`done`](Self::done).
    /// Ignored after shutdown.
    pub fn add(&self, key: K) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed, without blocking the caller.
    ///
    /// If the key is already scheduled, the earlier deadline wins.
    /// Must be called from within a Tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if state
                .waiting
                .get(&key)
                .is_some_and(|existing| *existing <= deadline)
            {
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let current = {
                let mut state = queue.inner.state.lock();
                if state.waiting.get(&key) == Some(&deadline) {
                    state.waiting.remove(&key);
                    true
                } else {
                    // Superseded by an earlier deadline.
                    false
                }
            };
            if current {
                queue.add(key);
            }
        });
    }

    /// Add `key` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Reset the rate limiter's failure history for `key`.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Wait for the next key.
    ///
    /// Suspends until a key is available. Returns `None` once the queue is
    /// shut down; keys still pending at that point are abandoned.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or
            // shutdown cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed.
    ///
    /// If it was re-added meanwhile it goes straight back into the queue.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and release every blocked [`get`](Self::get).
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
        }
        debug!("work queue shutting down");
        self.inner.notify.notify_waiters();
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys ready for a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True if no key is ready for a worker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where `key` currently sits, if anywhere.
    #[must_use]
    pub fn entry_state(&self, key: &K) -> Option<EntryState> {
        let state = self.inner.state.lock();
        let dirty = state.dirty.contains(key);
        if state.processing.contains(key) {
            return Some(if dirty {
                EntryState::DirtyWhileProcessing
            } else {
                EntryState::Processing
            });
        }
        if dirty {
            return Some(EntryState::Pending);
        }
        state.waiting.contains_key(key).then_some(EntryState::Waiting)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::queue::rate_limiter::ExponentialFailureRateLimiter;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Box::new(ExponentialFailureRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(420),
        )))
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let q = queue();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.entry_state(&"ns/a"), Some(EntryState::Pending));

        assert_eq!(q.get().await, Some("ns/a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_once_on_done() {
        let q = queue();
        q.add("ns/a");
        let key = q.get().await.unwrap();
        assert_eq!(q.entry_state(&key), Some(EntryState::Processing));

        q.add("ns/a");
        q.add("ns/a");
        assert!(q.is_empty());
        assert_eq!(q.entry_state(&key), Some(EntryState::DirtyWhileProcessing));

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("ns/a"));
        q.done(&"ns/a");
        assert_eq!(q.entry_state(&"ns/a"), None);
    }

    #[tokio::test]
    async fn test_done_without_readd_leaves_queue_empty() {
        let q = queue();
        q.add("ns/a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
        assert_eq!(q.entry_state(&key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_fires_after_delay() {
        let q = queue();
        q.add_after("ns/a", Duration::from_secs(30));
        assert_eq!(q.entry_state(&"ns/a"), Some(EntryState::Waiting));
        assert!(q.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(31), q.get()).await;
        assert_eq!(got.unwrap(), Some("ns/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("ns/a", Duration::from_secs(60));
        q.add_after("ns/a", Duration::from_secs(5));
        q.add_after("ns/a", Duration::from_secs(90));

        let got = tokio::time::timeout(Duration::from_secs(6), q.get()).await;
        assert_eq!(got.unwrap(), Some("ns/a"));
        q.done(&"ns/a");

        // The superseded 60s timer must not add the key again.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off() {
        let q = queue();
        q.add_rate_limited("ns/a");
        assert!(q.is_empty());
        assert_eq!(q.num_requeues(&"ns/a"), 1);

        let got = tokio::time::timeout(Duration::from_millis(1100), q.get()).await;
        assert_eq!(got.unwrap(), Some("ns/a"));

        q.forget(&"ns/a");
        assert_eq!(q.num_requeues(&"ns/a"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_get() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert_eq!(result.unwrap().unwrap(), None);
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_ignored() {
        let q = queue();
        q.shutdown();
        q.add("ns/a");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }
}
