//! Error types for the reconciler crate.
//!
//! Errors fall into two classes that drive the work queue: transient failures
//! are requeued with backoff, permanent failures are recorded in status and
//! forgotten until the resource changes. See [`Error::class`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue with backoff.
    Transient,
    /// Record in status, do not retry.
    Permanent,
}

/// How authentication failures from an external system are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailurePolicy {
    /// Credentials may be rotating; keep retrying with backoff.
    #[default]
    Transient,
    /// Credentials are wrong until someone edits them.
    Permanent,
}

/// Failures reported by an external system client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network or provider hiccup.
    #[error("transient provider error: {reason}")]
    Transient { reason: String },

    /// The provider rejected the request in a way retries cannot fix.
    #[error("permanent provider error: {reason}")]
    Permanent { reason: String },

    /// Authentication or authorization was refused.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// The referenced data does not exist upstream.
    #[error("key '{key}' does not exist upstream")]
    NotFoundUpstream { key: String },

    /// The call was abandoned because the controller is shutting down.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Create a transient error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Create a permanent error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    /// Create the not-found-upstream sentinel.
    pub fn not_found_upstream(key: impl Into<String>) -> Self {
        Self::NotFoundUpstream { key: key.into() }
    }

    fn class(&self, auth: AuthFailurePolicy) -> ErrorClass {
        match self {
            Self::Permanent { .. } => ErrorClass::Permanent,
            Self::AuthFailed { .. } => match auth {
                AuthFailurePolicy::Transient => ErrorClass::Transient,
                AuthFailurePolicy::Permanent => ErrorClass::Permanent,
            },
            Self::Transient { .. } | Self::NotFoundUpstream { .. } | Self::Cancelled => {
                ErrorClass::Transient
            }
        }
    }
}

/// Errors accumulated from several independent steps.
///
/// Nothing is dropped: every step's error is kept in order.
#[derive(Debug, Default)]
pub struct JoinedError {
    errors: Vec<Error>,
}

impl JoinedError {
    /// Create an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Append an error.
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// The collected errors.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Number of collected errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one error was collected.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Another worker holds the lock for this key.
    #[error("failed to acquire lock for '{key}': resource is locked")]
    LockConflict { key: String },

    /// An optimistic-concurrency write lost the race.
    #[error("conflicting update to '{key}'")]
    Conflict { key: String },

    /// A required object is missing.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: String },

    /// A store operation failed.
    #[error("store operation '{operation}' failed: {reason}")]
    Store { operation: String, reason: String },

    /// The external system failed.
    #[error("provider '{provider}' failed: {source}")]
    Fetch {
        provider: String,
        #[source]
        source: FetchError,
    },

    /// The resource spec cannot be reconciled as written.
    #[error("invalid spec for '{key}': {}", reasons.join("; "))]
    InvalidSpec { key: String, reasons: Vec<String> },

    /// No provider is registered under this name.
    #[error("provider '{name}' is not registered")]
    UnknownProvider { name: String },

    /// A provider name was registered twice.
    #[error("provider '{name}' registered more than once")]
    DuplicateProvider { name: String },

    /// The managed object belongs to another resource.
    #[error("managed object '{key}' is owned by '{owner}'")]
    OwnershipConflict { key: String, owner: String },

    /// The managed object does not match what was just written.
    #[error("managed object '{key}' failed verification: {reason}")]
    VerificationFailed { key: String, reason: String },

    /// A watch could not be started.
    #[error("watch for '{kind}' failed to start: {reason}")]
    WatchFailed { kind: String, reason: String },

    /// A multi-step change failed and was rolled back. Rollback failures,
    /// if any, are reported after the cause.
    #[error("{cause}{}", rollback_suffix(.rollback))]
    RolledBack {
        #[source]
        cause: Box<Error>,
        rollback: Option<JoinedError>,
    },

    /// Committing a multi-step change failed.
    #[error("commit failed: {0}")]
    Commit(#[source] JoinedError),

    /// The attempt was abandoned because the controller is shutting down.
    #[error("reconcile cancelled")]
    Cancelled,

    /// The attempt panicked.
    #[error("reconcile aborted: {reason}")]
    Aborted { reason: String },

    /// Invalid builder or runtime configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Core error.
    #[error(transparent)]
    Core(#[from] converge_core::Error),
}

impl Error {
    /// Create a lock conflict error.
    pub fn lock_conflict(key: impl Into<String>) -> Self {
        Self::LockConflict { key: key.into() }
    }

    /// Create an update conflict error.
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a store error.
    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a provider failure.
    pub fn fetch(provider: impl Into<String>, source: FetchError) -> Self {
        Self::Fetch {
            provider: provider.into(),
            source,
        }
    }

    /// Create an invalid spec error.
    pub fn invalid_spec(key: impl Into<String>, reasons: Vec<String>) -> Self {
        Self::InvalidSpec {
            key: key.into(),
            reasons,
        }
    }

    /// Create a verification error.
    pub fn verification_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a watch error.
    pub fn watch_failed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WatchFailed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Classify this error for the work queue.
    #[must_use]
    pub fn class(&self, auth: AuthFailurePolicy) -> ErrorClass {
        match self {
            Self::InvalidSpec { .. }
            | Self::UnknownProvider { .. }
            | Self::OwnershipConflict { .. }
            | Self::InvalidConfig { .. } => ErrorClass::Permanent,
            Self::Fetch { source, .. } => source.class(auth),
            Self::RolledBack { cause, .. } => cause.class(auth),
            _ => ErrorClass::Transient,
        }
    }

    /// True if this error, or anything it wraps, is the
    /// [`FetchError::NotFoundUpstream`] sentinel.
    #[must_use]
    pub fn is_not_found_upstream(&self) -> bool {
        find_in_chain::<FetchError>(self)
            .is_some_and(|e| matches!(e, FetchError::NotFoundUpstream { .. }))
    }

    /// True if this error means the attempt was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || find_in_chain::<FetchError>(self).is_some_and(|e| *e == FetchError::Cancelled)
            || matches!(self, Self::RolledBack { cause, .. } if cause.is_cancelled())
    }

    /// True if this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Walk the `source` chain looking for an error of type `T`.
fn find_in_chain<'a, T: std::error::Error + 'static>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

fn rollback_suffix(rollback: &Option<JoinedError>) -> String {
    rollback
        .as_ref()
        .map(|r| format!("; rollback failed: {r}"))
        .unwrap_or_default()
}
