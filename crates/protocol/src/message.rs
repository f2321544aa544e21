//! Sandbox wire protocol.
//!
//! Host→sandbox traffic is [`HostMessage`]; sandbox→host traffic is
//! [`SandboxMessage`]. Every request in either direction carries a
//! [`RequestId`] correlation token, and only data and method names ever cross
//! the boundary. Host functionality is reached by round-tripping a
//! [`HostCall`] back through the broker, never by passing function
//! references.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::manifest::{HookName, PluginCode};

/// Correlation token pairing an asynchronous request with its response.
pub type RequestId = Uuid;

/// Serializable view of the runtime handed to a plugin at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Id of the plugin the context belongs to.
    pub plugin_id: String,
    /// Plugin configuration value.
    #[serde(default)]
    pub config: Value,
    /// Upper bound for any timer the plugin schedules, in milliseconds.
    pub sandbox_timeout_ms: u64,
}

/// Log levels a sandbox may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Messages the host sends into an isolate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostMessage {
    /// Deliver the plugin entry point for evaluation. The response carries
    /// the exported method names.
    Load {
        request_id: RequestId,
        code: PluginCode,
        context: ContextSnapshot,
    },
    /// Invoke an exported method.
    Call {
        request_id: RequestId,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Invoke a declared lifecycle hook.
    Hook {
        request_id: RequestId,
        hook: HookName,
        #[serde(default)]
        data: Value,
    },
    /// Host reply to a sandbox-originated [`SandboxMessage::Request`].
    Response {
        request_id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// System broadcast, delivered best-effort with no acknowledgement.
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Messages an isolate sends back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SandboxMessage {
    /// Reply to a host-originated load/call/hook request.
    Response {
        request_id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Mediated host call; the host permission-checks and executes it, then
    /// replies with [`HostMessage::Response`].
    Request {
        request_id: RequestId,
        call: HostCall,
    },
    /// Plugin log line, forwarded to the host's tracing output.
    Log { level: LogLevel, message: String },
}

/// Mediated host operations a plugin may request.
///
/// Each variant is permission-checked on the host side before execution; a
/// denial is returned to the plugin as a recoverable error naming the
/// permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostCall {
    /// Read a value from the plugin's local store.
    StorageGet { key: String },
    /// Write a value, subject to the declared byte quota.
    StorageSet { key: String, value: Value },
    /// Delete a key from the plugin's local store.
    StorageDelete { key: String },
    /// Drop every key in the plugin's local store.
    StorageClear,
    /// HTTP GET gated by the network domain grant.
    NetFetch { url: String },
    /// Invoke an exported method of a peer plugin.
    PeerCall {
        plugin: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Surface a notification through the host UI layer.
    UiNotify { message: String },
    /// Timer, clamped to the sandbox timeout before it fires.
    Sleep { delay_ms: u64 },
    /// Publish a `plugin-action` event to host subscribers.
    Emit {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

impl HostCall {
    /// Short operation name used in audit entries and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            HostCall::StorageGet { .. } => "storage.get",
            HostCall::StorageSet { .. } => "storage.set",
            HostCall::StorageDelete { .. } => "storage.delete",
            HostCall::StorageClear => "storage.clear",
            HostCall::NetFetch { .. } => "net.fetch",
            HostCall::PeerCall { .. } => "plugins.call",
            HostCall::UiNotify { .. } => "ui.notify",
            HostCall::Sleep { .. } => "utils.sleep",
            HostCall::Emit { .. } => "emit",
        }
    }
}
