//! Level-triggered reconciliation scheduler.
//!
//! Resources declare which provider data their managed object should hold;
//! a [`Controller`] keeps every managed object converged under concurrency,
//! partial failure and provider rate limits.
//!
//! # Pieces
//!
//! - [`queue`] - deduplicating [`WorkQueue`] with at-most-one-in-flight per key,
//!   paced by exponential backoff combined with a global token bucket
//! - [`lock`] - non-blocking per-target locks
//! - [`gate`] - pure refresh decision, including tamper detection
//! - [`transaction`] - commit/rollback of the steps of one attempt
//! - [`watch`] - reference-counted shared watches
//! - [`reconciler`] - the attempt itself
//! - [`controller`] - the worker pool
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use converge_reconciler::{
//!     Controller, InMemoryDesiredStore, InMemoryObservedStore, ProviderRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> converge_reconciler::Result<()> {
//!     converge_reconciler::telemetry::init();
//!
//!     let desired = Arc::new(InMemoryDesiredStore::new());
//!     let observed = Arc::new(InMemoryObservedStore::new());
//!     let providers = ProviderRegistry::builder()
//!         .register("vault", Arc::new(MyVaultProvider::new()))
//!         .build()?;
//!
//!     let controller = Controller::builder()
//!         .with_in_memory_stores(desired.clone(), observed)
//!         .with_providers(providers)
//!         .build()?;
//!
//!     controller.pump(desired.subscribe());
//!     controller.run().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod lock;
pub mod provider;
pub mod queue;
pub mod reconciler;
pub mod resource;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod transaction;
pub mod watch;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerBuilder, StoreWatchStarter};
pub use error::{AuthFailurePolicy, Error, ErrorClass, FetchError, JoinedError, Result};
pub use gate::{GateDecision, ManagedArtifactState, RefreshConfig, RefreshPolicy};
pub use lock::{KeyLockGuard, KeyedLockManager, LockKey};
pub use provider::{ExternalClient, FetchRequest, Provider, ProviderRegistry, ProviderRegistryBuilder};
pub use queue::{EntryState, RateLimiter, WorkQueue};
pub use reconciler::{Action, Reconciler};
pub use resource::{
    CreationPolicy, DataRef, DeletionPolicy, ManagedObject, ObjectMeta, SecretData, SyncSpec,
    SyncedResource, TargetSpec,
};
pub use shutdown::Shutdown;
pub use store::{
    DesiredStore, InMemoryDesiredStore, InMemoryObservedStore, ObservedEvent, ObservedStore,
    StatusSink,
};
pub use transaction::{OrphanSweeper, StateManager, SweepQueue};
pub use watch::{WatchManager, WatchStarter};
