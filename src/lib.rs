//! A service-oriented component runtime: a ranking-ordered service
//! registry with LDAP-filtered lookup, an event dispatcher mediated by
//! event-listener hooks, and a component instance manager driven by
//! pluggable dependency-handler policies.

pub mod config;
pub mod context;
pub mod error;
pub mod framework;
pub mod handlers;
pub mod instance;
pub mod ldap;
pub mod registry;

pub use config::Config;
pub use error::{Result, RuntimeError};

/// Identifier of a bundle for the lifetime of the owning framework.
pub type BundleId = u64;

/// Identifier of a service for the lifetime of the owning framework.
pub type ServiceId = u64;
