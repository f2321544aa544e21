//! Sandbox lifecycle management.
//!
//! The manager owns the isolate table (one isolate per plugin while loaded
//! or disabled) and drives everything that crosses the boundary: code
//! loading, method and hook invocation through the broker, broadcast events,
//! and termination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use dplug_protocol::{ContextSnapshot, HookName, HostMessage, PluginCode, PluginManifest, RequestId, SandboxMessage};

use crate::broker::{MessageBroker, RequestError};
use crate::executor::ExecutorFactory;
use crate::worker::{self, Isolate};
use crate::{IsolationLevel, SandboxError};

/// Default bound on load and call round-trips.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);

/// Sandbox layer configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Isolation level applied to every new isolate.
    pub isolation: IsolationLevel,
    /// Timeout for code loading.
    pub load_timeout: Duration,
    /// Timeout for method and hook invocations.
    pub call_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Basic,
            load_timeout: DEFAULT_SANDBOX_TIMEOUT,
            call_timeout: DEFAULT_SANDBOX_TIMEOUT,
        }
    }
}

impl SandboxConfig {
    /// Short timeouts for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            isolation: IsolationLevel::None,
            load_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(500),
        }
    }
}

/// Creates, drives and terminates isolates.
pub struct SandboxManager {
    config: SandboxConfig,
    factory: Arc<dyn ExecutorFactory>,
    broker: MessageBroker,
    isolates: RwLock<HashMap<String, Isolate>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            config,
            factory,
            broker: MessageBroker::new(),
            isolates: RwLock::new(HashMap::new()),
        }
    }

    /// The broker correlating requests for every isolate. The host's
    /// dispatcher routes `SandboxMessage::Response` traffic here.
    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Create an isolate for `manifest` and return the sandbox→host stream.
    ///
    /// The caller owns the receiver and is expected to service it for the
    /// isolate's whole lifetime.
    pub async fn create_sandbox(
        &self,
        manifest: &PluginManifest,
    ) -> Result<mpsc::Receiver<SandboxMessage>, SandboxError> {
        let mut isolates = self.isolates.write().await;
        if isolates.contains_key(&manifest.id) {
            return Err(SandboxError::AlreadyExists(manifest.id.clone()));
        }
        let executor = self.factory.create(manifest, self.config.isolation)?;
        let (to_host_tx, to_host_rx) = mpsc::channel(64);
        let isolate = worker::spawn_isolate(manifest.id.clone(), executor, to_host_tx);
        isolates.insert(manifest.id.clone(), isolate);
        tracing::info!(
            plugin = %manifest.id,
            isolation = %self.config.isolation,
            "sandbox created"
        );
        Ok(to_host_rx)
    }

    /// Deliver the entry point and return the exported method names.
    pub async fn load_code(
        &self,
        plugin_id: &str,
        code: PluginCode,
        context: ContextSnapshot,
    ) -> Result<Vec<String>, SandboxError> {
        let channel = self.channel(plugin_id).await?;
        let outcome = self
            .broker
            .request(&channel, self.config.load_timeout, |request_id| {
                HostMessage::Load {
                    request_id,
                    code,
                    context,
                }
            })
            .await;
        match outcome {
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| SandboxError::Execution(format!("malformed export list: {e}"))),
            Err(RequestError::Timeout(timeout)) => Err(SandboxError::LoadTimeout {
                plugin: plugin_id.to_string(),
                seconds: timeout.as_secs(),
            }),
            Err(RequestError::Rejected(message)) => Err(SandboxError::Execution(message)),
            Err(RequestError::ChannelClosed) => {
                Err(SandboxError::ChannelClosed(plugin_id.to_string()))
            }
        }
    }

    /// Invoke an exported method.
    pub async fn call_method(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, SandboxError> {
        let channel = self.channel(plugin_id).await?;
        let outcome = self
            .broker
            .request(&channel, self.config.call_timeout, |request_id| {
                HostMessage::Call {
                    request_id,
                    method: method.to_string(),
                    args,
                }
            })
            .await;
        self.map_call_outcome(plugin_id, method, outcome)
    }

    /// Invoke a lifecycle hook.
    pub async fn invoke_hook(
        &self,
        plugin_id: &str,
        hook: HookName,
        data: Value,
    ) -> Result<Value, SandboxError> {
        let channel = self.channel(plugin_id).await?;
        let outcome = self
            .broker
            .request(&channel, self.config.call_timeout, |request_id| {
                HostMessage::Hook {
                    request_id,
                    hook,
                    data,
                }
            })
            .await;
        self.map_call_outcome(plugin_id, hook.as_str(), outcome)
    }

    /// Reply to a sandbox-originated mediated call.
    pub async fn deliver_response(
        &self,
        plugin_id: &str,
        request_id: RequestId,
        outcome: Result<Value, String>,
    ) -> Result<(), SandboxError> {
        let channel = self.channel(plugin_id).await?;
        let message = match outcome {
            Ok(result) => HostMessage::Response {
                request_id,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(error) => HostMessage::Response {
                request_id,
                success: false,
                result: None,
                error: Some(error),
            },
        };
        channel
            .send(message)
            .await
            .map_err(|_| SandboxError::ChannelClosed(plugin_id.to_string()))
    }

    /// Fan a system event out to the given plugins, best-effort.
    ///
    /// A full queue or a closed channel drops the event for that plugin;
    /// there is no acknowledgement.
    pub async fn broadcast_event(&self, targets: &[String], name: &str, payload: &Value) {
        let isolates = self.isolates.read().await;
        for target in targets {
            let Some(isolate) = isolates.get(target) else {
                continue;
            };
            let message = HostMessage::Event {
                name: name.to_string(),
                payload: payload.clone(),
            };
            if isolate.inbound.try_send(message).is_err() {
                tracing::debug!(plugin = %target, event = %name, "dropped broadcast event");
            }
        }
    }

    /// Tear an isolate down, releasing its tasks and channels. Idempotent.
    pub async fn terminate(&self, plugin_id: &str) {
        if let Some(isolate) = self.isolates.write().await.remove(plugin_id) {
            isolate.terminate();
            tracing::info!(plugin = %plugin_id, "sandbox terminated");
        }
    }

    /// True while an isolate exists for the plugin.
    pub async fn has_sandbox(&self, plugin_id: &str) -> bool {
        self.isolates.read().await.contains_key(plugin_id)
    }

    async fn channel(&self, plugin_id: &str) -> Result<mpsc::Sender<HostMessage>, SandboxError> {
        self.isolates
            .read()
            .await
            .get(plugin_id)
            .map(|isolate| isolate.inbound.clone())
            .ok_or_else(|| SandboxError::NotFound(plugin_id.to_string()))
    }

    fn map_call_outcome(
        &self,
        plugin_id: &str,
        method: &str,
        outcome: Result<Value, RequestError>,
    ) -> Result<Value, SandboxError> {
        match outcome {
            Ok(value) => Ok(value),
            Err(RequestError::Timeout(timeout)) => Err(SandboxError::CallTimeout {
                plugin: plugin_id.to_string(),
                method: method.to_string(),
                seconds: timeout.as_secs(),
            }),
            Err(RequestError::Rejected(message)) => Err(SandboxError::Execution(message)),
            Err(RequestError::ChannelClosed) => {
                Err(SandboxError::ChannelClosed(plugin_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dplug_protocol::CodeType;
    use serde_json::json;

    use crate::executor::{ExecError, HostBridge, PluginExecutor};

    /// Minimal executor echoing calls back; the full-featured mock lives in
    /// dplug-testing.
    struct EchoExecutor;

    #[async_trait]
    impl PluginExecutor for EchoExecutor {
        async fn load(
            &mut self,
            _code: &PluginCode,
            _context: &ContextSnapshot,
            _host: &HostBridge,
        ) -> Result<Vec<String>, ExecError> {
            Ok(vec!["echo".to_string()])
        }

        async fn invoke(
            &mut self,
            method: &str,
            args: &[Value],
            _host: &HostBridge,
        ) -> Result<Value, ExecError> {
            if method == "echo" {
                Ok(json!({ "args": args }))
            } else {
                Err(ExecError::UnknownMethod(method.to_string()))
            }
        }

        async fn hook(
            &mut self,
            hook: HookName,
            _data: &Value,
            _host: &HostBridge,
        ) -> Result<Value, ExecError> {
            Ok(json!(hook.as_str()))
        }
    }

    struct EchoFactory;

    impl ExecutorFactory for EchoFactory {
        fn create(
            &self,
            _manifest: &PluginManifest,
            _level: IsolationLevel,
        ) -> Result<Box<dyn PluginExecutor>, SandboxError> {
            Ok(Box::new(EchoExecutor))
        }
    }

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            main: "main.wasm".into(),
            code_type: CodeType::Bytecode,
            dependencies: Default::default(),
            permissions: None,
            hooks: Default::default(),
            exports: Default::default(),
            config_schema: None,
        }
    }

    fn context(id: &str) -> ContextSnapshot {
        ContextSnapshot {
            plugin_id: id.into(),
            config: Value::Null,
            sandbox_timeout_ms: 500,
        }
    }

    fn manager() -> SandboxManager {
        SandboxManager::new(SandboxConfig::for_testing(), Arc::new(EchoFactory))
    }

    /// Drive the sandbox→host stream, routing responses to the broker.
    fn pump(manager: &Arc<SandboxManager>, mut rx: mpsc::Receiver<SandboxMessage>) {
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let SandboxMessage::Response {
                    request_id,
                    success,
                    result,
                    error,
                } = message
                {
                    manager.broker().complete(request_id, success, result, error).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn load_and_call_round_trip() {
        let manager = Arc::new(manager());
        let rx = manager.create_sandbox(&manifest("echo")).await.unwrap();
        pump(&manager, rx);

        let exports = manager
            .load_code(
                "echo",
                PluginCode::Bytes(vec![0, 0x61, 0x73, 0x6d]),
                context("echo"),
            )
            .await
            .unwrap();
        assert_eq!(exports, vec!["echo".to_string()]);

        let result = manager
            .call_method("echo", "echo", vec![json!(1)])
            .await
            .unwrap();
        assert_eq!(result, json!({ "args": [1] }));
    }

    #[tokio::test]
    async fn duplicate_sandbox_is_rejected() {
        let manager = manager();
        let _rx = manager.create_sandbox(&manifest("dup")).await.unwrap();
        let second = manager.create_sandbox(&manifest("dup")).await;
        assert!(matches!(second, Err(SandboxError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn unknown_method_is_an_execution_error() {
        let manager = Arc::new(manager());
        let rx = manager.create_sandbox(&manifest("echo")).await.unwrap();
        pump(&manager, rx);

        let outcome = manager.call_method("echo", "missing", vec![]).await;
        match outcome {
            Err(SandboxError::Execution(message)) => {
                assert!(message.contains("missing"));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_closes_the_channel() {
        let manager = Arc::new(manager());
        let rx = manager.create_sandbox(&manifest("gone")).await.unwrap();
        pump(&manager, rx);

        manager.terminate("gone").await;
        manager.terminate("gone").await;
        assert!(!manager.has_sandbox("gone").await);

        let outcome = manager.call_method("gone", "echo", vec![]).await;
        assert!(matches!(outcome, Err(SandboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn calls_against_missing_sandbox_fail() {
        let manager = manager();
        let outcome = manager.call_method("ghost", "echo", vec![]).await;
        assert!(matches!(outcome, Err(SandboxError::NotFound(_))));
    }
}
