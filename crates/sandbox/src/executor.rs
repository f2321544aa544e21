//! Executor seam: the code that actually runs plugin programs.
//!
//! The sandbox layer is engine-agnostic. An [`ExecutorFactory`] produces one
//! [`PluginExecutor`] per isolate; the built-in factory covers WASM bytecode
//! when the `wasm` feature is enabled, and embedders plug in their own
//! engines for anything else. Executors receive only data plus a
//! [`HostBridge`], the sole path back to host functionality.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use dplug_protocol::{
    ContextSnapshot, HookName, HostCall, LogLevel, PluginCode, PluginManifest, RequestId,
    SandboxMessage,
};

use crate::{IsolationLevel, SandboxError};

/// Errors raised by executor implementations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The plugin code raised an uncaught error.
    #[error("{0}")]
    Failed(String),

    /// The requested method is not exported by the loaded code.
    #[error("method '{0}' is not exported")]
    UnknownMethod(String),

    /// The executor cannot run the delivered code payload.
    #[error("unsupported code payload")]
    UnsupportedCode,
}

type MediatedSender = oneshot::Sender<Result<Value, String>>;

/// Sandbox-side endpoint for mediated host calls.
///
/// `call` round-trips one [`HostCall`] through the message channel and waits
/// for the host's reply; the isolate router completes the matching entry when
/// the response message arrives. Errors carry the host's error string
/// (permission denials, quota rejections) and are recoverable inside the
/// plugin.
#[derive(Clone)]
pub struct HostBridge {
    to_host: mpsc::Sender<SandboxMessage>,
    pending: Arc<Mutex<HashMap<RequestId, MediatedSender>>>,
}

impl HostBridge {
    pub(crate) fn new(to_host: mpsc::Sender<SandboxMessage>) -> Self {
        Self {
            to_host,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Round-trip a mediated host call.
    pub async fn call(&self, call: HostCall) -> Result<Value, String> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self
            .to_host
            .send(SandboxMessage::Request { request_id, call })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&request_id);
            return Err("host channel closed".to_string());
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err("host channel closed".to_string()),
        }
    }

    /// Emit a log line on the host's tracing output.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self
            .to_host
            .send(SandboxMessage::Log {
                level,
                message: message.into(),
            })
            .await;
    }

    /// Complete the mediated call awaiting `request_id`.
    pub(crate) async fn complete(
        &self,
        request_id: RequestId,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let Some(tx) = self.pending.lock().await.remove(&request_id) else {
            tracing::debug!(%request_id, "host response with no waiting mediated call");
            return;
        };
        let outcome = if success {
            Ok(result.unwrap_or(Value::Null))
        } else {
            Err(error.unwrap_or_else(|| "unknown host error".to_string()))
        };
        let _ = tx.send(outcome);
    }
}

/// Executes one plugin's code inside its isolate worker.
///
/// Implementations are single-threaded by construction: the isolate runs one
/// job at a time, mirroring the execution model of the runtime a plugin
/// targets.
#[async_trait]
pub trait PluginExecutor: Send {
    /// Evaluate the entry point and return the exported method names.
    async fn load(
        &mut self,
        code: &PluginCode,
        context: &ContextSnapshot,
        host: &HostBridge,
    ) -> Result<Vec<String>, ExecError>;

    /// Invoke an exported method.
    async fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        host: &HostBridge,
    ) -> Result<Value, ExecError>;

    /// Invoke a declared lifecycle hook.
    async fn hook(
        &mut self,
        hook: HookName,
        data: &Value,
        host: &HostBridge,
    ) -> Result<Value, ExecError>;

    /// Deliver a broadcast event. Best-effort; the default ignores it.
    async fn on_event(&mut self, _name: &str, _payload: &Value, _host: &HostBridge) {}
}

/// Creates executors for new isolates.
pub trait ExecutorFactory: Send + Sync {
    /// Produce an executor for the manifest at the given isolation level.
    fn create(
        &self,
        manifest: &PluginManifest,
        level: IsolationLevel,
    ) -> Result<Box<dyn PluginExecutor>, SandboxError>;
}

/// Built-in factory: WASM for bytecode manifests when the `wasm` feature is
/// enabled. Script manifests need an embedder-provided factory.
#[derive(Debug, Default)]
pub struct DefaultExecutorFactory;

impl ExecutorFactory for DefaultExecutorFactory {
    fn create(
        &self,
        manifest: &PluginManifest,
        level: IsolationLevel,
    ) -> Result<Box<dyn PluginExecutor>, SandboxError> {
        match manifest.code_type {
            #[cfg(feature = "wasm")]
            dplug_protocol::CodeType::Bytecode => {
                Ok(Box::new(crate::wasm::WasmExecutor::new(level)))
            }
            #[cfg(not(feature = "wasm"))]
            dplug_protocol::CodeType::Bytecode => {
                let _ = level;
                Err(SandboxError::UnsupportedCode("bytecode"))
            }
            dplug_protocol::CodeType::Script => Err(SandboxError::UnsupportedCode("script")),
        }
    }
}
