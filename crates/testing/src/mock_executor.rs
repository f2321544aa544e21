//! Scripted mock executor.
//!
//! The mock runs inside a real isolate worker, so everything it does crosses
//! the same channels and broker a production engine would use, mediated
//! host calls included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use dplug_protocol::{ContextSnapshot, HookName, HostCall, PluginCode, PluginManifest};
use dplug_sandbox::{
    ExecError, ExecutorFactory, HostBridge, IsolationLevel, PluginExecutor, SandboxError,
};

/// What a scripted method or hook does when invoked.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Respond with a fixed value.
    Return(Value),
    /// Fail with an error message, like an uncaught plugin exception.
    Fail(String),
    /// Sleep before responding; long delays trigger host-side timeouts.
    Delay { ms: u64, then: Value },
    /// Round-trip mediated host calls and return the outcomes as an array of
    /// `{"ok": value}` / `{"err": message}` objects, so tests can observe
    /// recoverable denials.
    HostCalls(Vec<HostCall>),
}

/// Scripted behavior plan for one plugin.
#[derive(Debug, Clone, Default)]
pub struct MockPlugin {
    exports: Vec<String>,
    behaviors: HashMap<String, MockBehavior>,
    hooks: HashMap<&'static str, MockBehavior>,
    load_delay_ms: u64,
    fail_load: Option<String>,
    event_log: Option<Arc<Mutex<Vec<(String, Value)>>>>,
}

impl MockPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a method with the given behavior.
    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>, behavior: MockBehavior) -> Self {
        let name = name.into();
        self.exports.push(name.clone());
        self.behaviors.insert(name, behavior);
        self
    }

    /// Script a lifecycle hook.
    #[must_use]
    pub fn with_hook(mut self, hook: HookName, behavior: MockBehavior) -> Self {
        self.hooks.insert(hook.as_str(), behavior);
        self
    }

    /// Sleep during load; longer than the sandbox timeout produces a load
    /// timeout.
    #[must_use]
    pub fn with_load_delay(mut self, ms: u64) -> Self {
        self.load_delay_ms = ms;
        self
    }

    /// Make loading fail with this message.
    #[must_use]
    pub fn with_load_failure(mut self, message: impl Into<String>) -> Self {
        self.fail_load = Some(message.into());
        self
    }

    /// Record every broadcast event the plugin receives into `log`.
    #[must_use]
    pub fn with_event_log(mut self, log: Arc<Mutex<Vec<(String, Value)>>>) -> Self {
        self.event_log = Some(log);
        self
    }
}

struct MockExecutor {
    plan: MockPlugin,
}

impl MockExecutor {
    async fn run(&self, behavior: &MockBehavior, host: &HostBridge) -> Result<Value, ExecError> {
        match behavior {
            MockBehavior::Return(value) => Ok(value.clone()),
            MockBehavior::Fail(message) => Err(ExecError::Failed(message.clone())),
            MockBehavior::Delay { ms, then } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(then.clone())
            }
            MockBehavior::HostCalls(calls) => {
                let mut outcomes = Vec::with_capacity(calls.len());
                for call in calls {
                    match host.call(call.clone()).await {
                        Ok(value) => outcomes.push(json!({ "ok": value })),
                        Err(message) => outcomes.push(json!({ "err": message })),
                    }
                }
                Ok(Value::Array(outcomes))
            }
        }
    }
}

#[async_trait]
impl PluginExecutor for MockExecutor {
    async fn load(
        &mut self,
        _code: &PluginCode,
        _context: &ContextSnapshot,
        _host: &HostBridge,
    ) -> Result<Vec<String>, ExecError> {
        if self.plan.load_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.plan.load_delay_ms)).await;
        }
        if let Some(message) = &self.plan.fail_load {
            return Err(ExecError::Failed(message.clone()));
        }
        Ok(self.plan.exports.clone())
    }

    async fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        host: &HostBridge,
    ) -> Result<Value, ExecError> {
        let _ = args;
        let behavior = self
            .plan
            .behaviors
            .get(method)
            .cloned()
            .ok_or_else(|| ExecError::UnknownMethod(method.to_string()))?;
        self.run(&behavior, host).await
    }

    async fn hook(
        &mut self,
        hook: HookName,
        _data: &Value,
        host: &HostBridge,
    ) -> Result<Value, ExecError> {
        match self.plan.hooks.get(hook.as_str()).cloned() {
            Some(behavior) => self.run(&behavior, host).await,
            // Declared but unscripted hooks succeed silently.
            None => Ok(Value::Null),
        }
    }

    async fn on_event(&mut self, name: &str, payload: &Value, host: &HostBridge) {
        if let Some(log) = &self.plan.event_log {
            log.lock().unwrap().push((name.to_string(), payload.clone()));
        }
        host.log(
            dplug_protocol::LogLevel::Debug,
            format!("event {name}: {payload}"),
        )
        .await;
    }
}

/// Factory producing scripted executors; counts every sandbox it creates.
#[derive(Default)]
pub struct MockExecutorFactory {
    plans: Mutex<HashMap<String, MockPlugin>>,
    created: AtomicUsize,
}

impl MockExecutorFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behavior plan for a plugin id.
    pub fn register(&self, plugin_id: impl Into<String>, plan: MockPlugin) {
        self.plans.lock().unwrap().insert(plugin_id.into(), plan);
    }

    /// Number of sandboxes created so far. An idempotent re-load must not
    /// increase this.
    pub fn created_sandboxes(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ExecutorFactory for MockExecutorFactory {
    fn create(
        &self,
        manifest: &PluginManifest,
        _level: IsolationLevel,
    ) -> Result<Box<dyn PluginExecutor>, SandboxError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&manifest.id)
            .cloned()
            .unwrap_or_else(|| {
                // Unscripted plugins export what their manifest declares and
                // answer every call with null.
                let mut plan = MockPlugin::new();
                for name in &manifest.exports {
                    plan = plan.with_export(name.clone(), MockBehavior::Return(Value::Null));
                }
                plan
            });
        Ok(Box::new(MockExecutor { plan }))
    }
}
