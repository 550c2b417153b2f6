//! Tollbridge supervisor.
//!
//! Loads configuration, builds the shared upstream registry, discovers the
//! static OIDC upstreams and runs the LDAP and Active Directory upstream
//! controllers until shutdown.
//!
//! ## Modules
//!
//! - [`config`] - Configuration types and loader
//! - [`observability`] - Tracing initialization
//! - [`supervisor`] - Process wiring

pub mod config;
pub mod observability;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use supervisor::{Supervisor, SupervisorBuilder};
