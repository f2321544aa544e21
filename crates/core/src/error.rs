//! Error types for the dplug core runtime.

use thiserror::Error;

use dplug_protocol::ManifestError;
use dplug_sandbox::SandboxError;

/// Result type alias for core runtime operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors surfaced by the plugin registry and the mediated context API.
///
/// Permission and quota errors are recoverable: they are returned
/// synchronously from the mediated call and plugin code may catch them.
/// Timeouts and execution failures reject the pending call and force the
/// plugin into the error status; recovery is an explicit `load_plugin`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// No manifest is registered under this id.
    #[error("no manifest registered for plugin '{0}'")]
    ManifestNotFound(String),

    /// A manifest with this id is already registered.
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The plugin is already loaded; the operation was a no-op.
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// The plugin is not loaded.
    #[error("plugin '{0}' is not loaded")]
    NotLoaded(String),

    /// The plugin does not export the requested method.
    #[error("plugin '{plugin}' does not export method '{method}'")]
    UnknownMethod { plugin: String, method: String },

    /// A mediated call was denied; carries the canonical permission string.
    #[error("permission denied: {permission}")]
    PermissionDenied { permission: String },

    /// A storage write would exceed the plugin's declared byte cap.
    #[error("storage quota exceeded for plugin '{plugin}': write of {requested} bytes over {limit} byte cap")]
    StorageQuotaExceeded {
        plugin: String,
        requested: u64,
        limit: u64,
    },

    /// The manifest failed structural validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    /// A plugin repository request failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// Sandbox-layer failure: load/call timeouts, execution errors,
    /// terminated isolates.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Value serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// True for failures that force the plugin into the error status.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PluginError::Sandbox(
                SandboxError::LoadTimeout { .. }
                    | SandboxError::CallTimeout { .. }
                    | SandboxError::Execution(_)
                    | SandboxError::ChannelClosed(_)
            )
        )
    }
}
