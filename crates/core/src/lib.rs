//! Core types, errors, and status bookkeeping for converge.
//!
//! The scheduler crate builds on three things defined here:
//!
//! - [`ResourceKey`] - the `{namespace, name}` unit of deduplication
//! - [`ResourceStatus`] and [`Condition`] - what a resource reports back
//! - [`Error`] - configuration and key parsing failures

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod key;
pub mod status;

pub use error::{Error, Result};
pub use key::{ReconcileRequest, ResourceKey};
pub use status::{
    reasons, Condition, ConditionStatus, ConditionType, ResourceStatus, SyncBookkeeping,
};
