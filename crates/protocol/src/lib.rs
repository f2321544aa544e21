//! Data model and wire protocol for the dplug plugin runtime.
//!
//! This crate defines everything that crosses the isolation boundary or is
//! persisted about a plugin: the manifest format, typed capability grants,
//! the host/sandbox message enums and the host event kinds. It is pure data
//! with no runtime or I/O, so both sides of the boundary can depend on it.

pub mod capability;
pub mod event;
pub mod manifest;
pub mod message;
pub mod version;

pub use capability::{Capability, PermissionSpec, ScopeGrant, StorageGrant, DEFAULT_STORAGE_SIZE};
pub use event::PluginEvent;
pub use manifest::{CodeType, HookName, ManifestError, PluginCode, PluginManifest};
pub use message::{ContextSnapshot, HostCall, HostMessage, LogLevel, RequestId, SandboxMessage};
pub use version::is_newer_version;
