//! Directory upstream controller for Tollbridge.
//!
//! Watches `LDAPIdentityProvider` and `ActiveDirectoryIdentityProvider`
//! resources, validates their bind secrets and TLS settings, probes the
//! directory, and publishes the resulting providers to the shared
//! [`UpstreamRegistry`](tollbridge_auth::federation::UpstreamRegistry).
//!
//! ## Modules
//!
//! - [`resources`] - Resource, status and secret types
//! - [`conditions`] - Status conditions and merging
//! - [`store`] - Resource and secret store traits plus an in-memory store
//! - [`secret_cache`] - Validated bind secret versions
//! - [`watcher`] - The reconciliation pass
//! - [`runner`] - Background driver with resync, triggers and requeue backoff
//! - [`error`] - Error types

pub mod conditions;
pub mod error;
pub mod resources;
pub mod runner;
pub mod secret_cache;
pub mod store;
pub mod watcher;

pub use conditions::{Condition, ConditionStatus};
pub use error::{ReconcileError, ReconcileResult, StoreError};
pub use resources::{
    DirectoryIdentityProvider, DirectoryProviderSpec, DirectoryProviderStatus, ObjectMeta, Phase,
    Secret,
};
pub use runner::{ControllerConfig, ControllerRunner, Reconciler, RunnerStats};
pub use secret_cache::SecretVersionCache;
pub use store::{DirectoryProviderStore, InMemoryStore, SecretStore};
pub use watcher::{DirectoryUpstreamWatcher, PassOutcome};
