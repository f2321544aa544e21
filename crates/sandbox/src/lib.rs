//! Sandbox layer for the dplug plugin runtime.
//!
//! Each plugin runs inside an isolate: a pair of tasks joined to the host
//! only by message channels. The [`broker::MessageBroker`] correlates
//! host-originated requests with sandbox responses; the
//! [`manager::SandboxManager`] owns the isolate table and drives code
//! loading, method invocation and termination.
//!
//! The hard isolation rule: only data and method names cross the boundary.
//! Host functionality is reached by round-tripping a
//! [`dplug_protocol::HostCall`] back through the broker, never by handing a
//! function reference into the sandbox.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod broker;
pub mod executor;
pub mod manager;
mod worker;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use broker::{MessageBroker, RequestError};
pub use executor::{DefaultExecutorFactory, ExecError, ExecutorFactory, HostBridge, PluginExecutor};
pub use manager::{SandboxConfig, SandboxManager};

/// How strongly a plugin is isolated from the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// No resource limits; for trusted first-party plugins and tests.
    None,
    /// Bounded fuel and memory.
    #[default]
    Basic,
    /// Tight fuel and memory bounds for untrusted third-party code.
    Strict,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::None => write!(f, "none"),
            IsolationLevel::Basic => write!(f, "basic"),
            IsolationLevel::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(IsolationLevel::None),
            "basic" => Ok(IsolationLevel::Basic),
            "strict" => Ok(IsolationLevel::Strict),
            _ => Err(format!(
                "Unknown isolation level: '{s}'. Valid levels: none, basic, strict"
            )),
        }
    }
}

/// Errors produced by the sandbox layer.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A sandbox for this plugin already exists.
    #[error("sandbox for plugin '{0}' already exists")]
    AlreadyExists(String),

    /// No sandbox exists for this plugin.
    #[error("no sandbox for plugin '{0}'")]
    NotFound(String),

    /// Code loading exceeded the configured timeout.
    #[error("loading plugin '{plugin}' timed out after {seconds}s")]
    LoadTimeout { plugin: String, seconds: u64 },

    /// A method or hook invocation exceeded the configured timeout.
    #[error("call to '{plugin}.{method}' timed out after {seconds}s")]
    CallTimeout {
        plugin: String,
        method: String,
        seconds: u64,
    },

    /// The plugin code raised an uncaught error.
    #[error("plugin execution failed: {0}")]
    Execution(String),

    /// The isolate's channel is gone (terminated or crashed).
    #[error("sandbox channel closed for plugin '{0}'")]
    ChannelClosed(String),

    /// No executor is available for the manifest's code type.
    #[error("no executor available for {0} code")]
    UnsupportedCode(&'static str),
}
