//! Core plugin runtime: registry, permission enforcement, bounded storage,
//! audit trail and repository updater.
//!
//! A [`registry::PluginRegistry`] is one self-contained host. Plugins are
//! registered from manifests, loaded into isolates owned by the sandbox
//! layer, and reach host functionality only through the mediated context
//! API, which permission-checks every call and records security-relevant
//! outcomes in the audit ring.
//!
//! ```rust,ignore
//! use dplug_core::{HostConfig, PluginRegistry};
//!
//! let registry = PluginRegistry::new(HostConfig::default());
//! registry.register_plugin(manifest, code).await?;
//! registry.load_plugin("weather").await?;
//! let forecast = registry.call_plugin("weather", "getForecast", vec![]).await?;
//! ```

pub mod audit;
pub mod config;
mod context;
pub mod error;
pub mod events;
pub mod permissions;
pub mod registry;
pub mod storage;
mod updater;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use config::HostConfig;
pub use error::{PluginError, Result};
pub use events::EventBus;
pub use permissions::PermissionEvaluator;
pub use registry::{PluginMetrics, PluginRegistry, PluginStatus, PluginSummary};
pub use storage::StorageQuotaManager;

// Re-export the protocol and sandbox types collaborators need.
pub use dplug_protocol::{
    Capability, CodeType, HookName, PermissionSpec, PluginCode, PluginEvent, PluginManifest,
};
pub use dplug_sandbox::{ExecutorFactory, IsolationLevel, PluginExecutor};
