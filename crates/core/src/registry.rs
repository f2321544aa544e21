//! Plugin registry: manifest storage, lifecycle state machine and the
//! public collaborator surface.
//!
//! The registry is one explicitly constructed aggregate: plugin map,
//! sandbox table, storage, permission cache and audit ring all hang off a
//! single `Arc`, so independent hosts coexist without hidden shared state.
//!
//! Lifecycle: `Unloaded → Loading → {Loaded | Error}`, `Loaded ⇄ Disabled`,
//! any state back to `Unloaded` via unload, and `destroy` tears everything
//! down. A failed load is never retried automatically; recovery is an
//! explicit `load_plugin`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use dplug_protocol::{
    ContextSnapshot, HookName, PermissionSpec, PluginCode, PluginEvent, PluginManifest,
    DEFAULT_STORAGE_SIZE,
};
use dplug_sandbox::{DefaultExecutorFactory, ExecutorFactory, SandboxManager};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::config::HostConfig;
use crate::context;
use crate::error::{PluginError, Result};
use crate::events::EventBus;
use crate::permissions::PermissionEvaluator;
use crate::storage::StorageQuotaManager;
use crate::updater;

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Unloaded,
    Loading,
    Loaded,
    Disabled,
    Error,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PluginStatus::Unloaded => "unloaded",
            PluginStatus::Loading => "loading",
            PluginStatus::Loaded => "loaded",
            PluginStatus::Disabled => "disabled",
            PluginStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Per-instance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PluginMetrics {
    /// Milliseconds the last successful load took.
    pub load_time_ms: u64,
    /// Method calls plus mediated context calls.
    pub api_calls: u64,
    /// Failed calls, denials and fatal errors.
    pub errors: u64,
}

/// One registered plugin. Exactly one instance exists per manifest id.
pub(crate) struct PluginInstance {
    pub(crate) manifest: Arc<PluginManifest>,
    pub(crate) code: PluginCode,
    pub(crate) status: PluginStatus,
    pub(crate) exports: BTreeSet<String>,
    pub(crate) config: Value,
    pub(crate) last_error: Option<String>,
    pub(crate) metrics: PluginMetrics,
}

/// Read-only view of a plugin for collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    /// Last error message while `status` is `error`.
    pub error: Option<String>,
    pub metrics: PluginMetrics,
    pub exports: Vec<String>,
}

pub(crate) struct RegistryTasks {
    pub(crate) updater: Option<JoinHandle<()>>,
    pub(crate) dispatchers: HashMap<String, JoinHandle<()>>,
}

/// Shared state behind a [`PluginRegistry`] handle.
pub(crate) struct RegistryInner {
    pub(crate) config: HostConfig,
    pub(crate) plugins: RwLock<HashMap<String, PluginInstance>>,
    pub(crate) sandbox: SandboxManager,
    pub(crate) permissions: PermissionEvaluator,
    pub(crate) storage: StorageQuotaManager,
    pub(crate) audit: AuditLog,
    pub(crate) events: EventBus,
    pub(crate) http: reqwest::Client,
    pub(crate) tasks: Mutex<RegistryTasks>,
}

impl RegistryInner {
    /// Permission block and storage cap for a mediated call.
    pub(crate) async fn permission_context(
        &self,
        plugin_id: &str,
    ) -> Option<(Option<PermissionSpec>, u64)> {
        self.plugins.read().await.get(plugin_id).map(|instance| {
            let spec = instance.manifest.permissions.clone();
            let cap = spec
                .as_ref()
                .map_or(DEFAULT_STORAGE_SIZE, PermissionSpec::storage_cap);
            (spec, cap)
        })
    }

    /// Count one mediated or collaborator call against the instance.
    pub(crate) async fn bump_api_call(&self, plugin_id: &str, failed: bool) {
        if let Some(instance) = self.plugins.write().await.get_mut(plugin_id) {
            instance.metrics.api_calls += 1;
            if failed {
                instance.metrics.errors += 1;
            }
        }
    }

    /// Force a plugin into the error status, recording and emitting the
    /// failure.
    pub(crate) async fn fail_plugin(
        &self,
        plugin_id: &str,
        error: &PluginError,
        action: AuditAction,
    ) {
        let message = error.to_string();
        if let Some(instance) = self.plugins.write().await.get_mut(plugin_id) {
            instance.status = PluginStatus::Error;
            instance.last_error = Some(message.clone());
            instance.metrics.errors += 1;
        }
        self.audit
            .append(plugin_id, action, json!({ "error": message }))
            .await;
        self.events.emit(PluginEvent::PluginError {
            id: plugin_id.to_string(),
            error: message,
        });
    }
}

/// Handle to a plugin host.
///
/// Cloning is cheap and every clone refers to the same host.
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RegistryInner>,
}

impl PluginRegistry {
    /// Create a host with the built-in executor factory.
    ///
    /// Must be called within a tokio runtime: the registry spawns its
    /// repository poller when a repository URL is configured.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultExecutorFactory))
    }

    /// Create a host with a custom executor factory.
    #[must_use]
    pub fn with_factory(config: HostConfig, factory: Arc<dyn ExecutorFactory>) -> Self {
        let sandbox = SandboxManager::new(config.sandbox_config(), factory);
        let inner = Arc::new(RegistryInner {
            permissions: PermissionEvaluator::new(config.default_allow),
            audit: AuditLog::new(config.audit_capacity),
            sandbox,
            storage: StorageQuotaManager::new(),
            events: EventBus::new(),
            http: reqwest::Client::new(),
            plugins: RwLock::new(HashMap::new()),
            tasks: Mutex::new(RegistryTasks {
                updater: None,
                dispatchers: HashMap::new(),
            }),
            config,
        });
        let registry = Self { inner };
        if registry.inner.config.repository_url.is_some() {
            let handle = updater::spawn(&registry.inner);
            if let Ok(mut tasks) = registry.inner.tasks.try_lock() {
                tasks.updater = Some(handle);
            }
        }
        registry
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Register a manifest with its entry-point code. The instance starts
    /// `unloaded`.
    pub async fn register_plugin(&self, manifest: PluginManifest, code: PluginCode) -> Result<()> {
        manifest.validate()?;
        let id = manifest.id.clone();
        let version = manifest.version.clone();
        {
            let mut plugins = self.inner.plugins.write().await;
            if plugins.contains_key(&id) {
                return Err(PluginError::AlreadyRegistered(id));
            }
            plugins.insert(
                id.clone(),
                PluginInstance {
                    manifest: Arc::new(manifest),
                    code,
                    status: PluginStatus::Unloaded,
                    exports: BTreeSet::new(),
                    config: Value::Null,
                    last_error: None,
                    metrics: PluginMetrics::default(),
                },
            );
        }
        self.inner
            .audit
            .append(&id, AuditAction::Registered, json!({ "version": version }))
            .await;
        tracing::info!(plugin = %id, %version, "plugin registered");
        Ok(())
    }

    /// Unload a plugin and drop its manifest, storage and cached decisions.
    pub async fn remove_plugin(&self, id: &str) -> Result<()> {
        if !self.inner.plugins.read().await.contains_key(id) {
            return Err(PluginError::ManifestNotFound(id.to_string()));
        }
        self.unload_plugin(id).await?;
        self.inner.plugins.write().await.remove(id);
        self.inner.storage.remove_plugin(id).await;
        self.inner.permissions.invalidate(id).await;
        self.inner
            .audit
            .append(id, AuditAction::Removed, Value::Null)
            .await;
        Ok(())
    }

    /// Load a plugin: create its sandbox, deliver the code, run `onLoad`.
    ///
    /// Loading an already-loaded plugin is a logged no-op; no second
    /// sandbox is created. Any failure forces the `error` status and is
    /// never retried automatically.
    pub async fn load_plugin(&self, id: &str) -> Result<()> {
        let (manifest, code, config_value) = {
            let mut plugins = self.inner.plugins.write().await;
            let instance = plugins
                .get_mut(id)
                .ok_or_else(|| PluginError::ManifestNotFound(id.to_string()))?;
            match instance.status {
                PluginStatus::Loaded | PluginStatus::Loading | PluginStatus::Disabled => {
                    tracing::debug!(plugin = %id, status = %instance.status, "load is a no-op");
                    return Ok(());
                }
                PluginStatus::Unloaded | PluginStatus::Error => {}
            }
            instance.status = PluginStatus::Loading;
            instance.last_error = None;
            (
                Arc::clone(&instance.manifest),
                instance.code.clone(),
                instance.config.clone(),
            )
        };

        let started = Instant::now();
        match self.run_load(&manifest, code, config_value).await {
            Ok(exports) => {
                let elapsed = started.elapsed().as_millis() as u64;
                {
                    let mut plugins = self.inner.plugins.write().await;
                    if let Some(instance) = plugins.get_mut(id) {
                        instance.status = PluginStatus::Loaded;
                        instance.exports = exports;
                        instance.metrics.load_time_ms = elapsed;
                    }
                }
                self.inner
                    .audit
                    .append(id, AuditAction::Loaded, json!({ "load_time_ms": elapsed }))
                    .await;
                self.inner
                    .events
                    .emit(PluginEvent::PluginLoaded { id: id.to_string() });
                tracing::info!(plugin = %id, elapsed_ms = elapsed, "plugin loaded");
                Ok(())
            }
            Err(error) => {
                self.inner.sandbox.terminate(id).await;
                self.inner
                    .fail_plugin(id, &error, AuditAction::LoadFailed)
                    .await;
                Err(error)
            }
        }
    }

    async fn run_load(
        &self,
        manifest: &Arc<PluginManifest>,
        code: PluginCode,
        config_value: Value,
    ) -> Result<BTreeSet<String>> {
        let inner = &self.inner;
        // A previous fatal error may have left an orphaned isolate behind.
        inner.sandbox.terminate(&manifest.id).await;
        let stream = inner.sandbox.create_sandbox(manifest).await?;
        let dispatcher =
            context::spawn_dispatcher(Arc::downgrade(inner), manifest.id.clone(), stream);
        inner
            .tasks
            .lock()
            .await
            .dispatchers
            .insert(manifest.id.clone(), dispatcher);

        let snapshot = ContextSnapshot {
            plugin_id: manifest.id.clone(),
            config: config_value,
            sandbox_timeout_ms: inner.config.sandbox_timeout.as_millis() as u64,
        };
        let exports = inner
            .sandbox
            .load_code(&manifest.id, code, snapshot)
            .await?;
        if manifest.declares_hook(HookName::OnLoad) {
            inner
                .sandbox
                .invoke_hook(&manifest.id, HookName::OnLoad, Value::Null)
                .await?;
        }
        Ok(exports.into_iter().collect())
    }

    /// Unload a plugin: run `onUnload`, terminate the isolate, drop cached
    /// permission decisions.
    ///
    /// A failing `onUnload` hook is logged and still forces the `error`
    /// status; the isolate is torn down either way.
    pub async fn unload_plugin(&self, id: &str) -> Result<()> {
        let (manifest, status) = {
            let plugins = self.inner.plugins.read().await;
            let instance = plugins
                .get(id)
                .ok_or_else(|| PluginError::ManifestNotFound(id.to_string()))?;
            (Arc::clone(&instance.manifest), instance.status)
        };
        if status == PluginStatus::Unloaded {
            return Ok(());
        }

        let mut hook_error = None;
        if matches!(status, PluginStatus::Loaded | PluginStatus::Disabled)
            && manifest.declares_hook(HookName::OnUnload)
        {
            if let Err(error) = self
                .inner
                .sandbox
                .invoke_hook(id, HookName::OnUnload, Value::Null)
                .await
            {
                tracing::warn!(plugin = %id, %error, "onUnload hook failed");
                hook_error = Some(error.to_string());
            }
        }

        self.inner.sandbox.terminate(id).await;
        self.inner.permissions.invalidate(id).await;
        self.inner.tasks.lock().await.dispatchers.remove(id);

        {
            let mut plugins = self.inner.plugins.write().await;
            if let Some(instance) = plugins.get_mut(id) {
                instance.exports.clear();
                match &hook_error {
                    Some(message) => {
                        instance.status = PluginStatus::Error;
                        instance.last_error = Some(message.clone());
                        instance.metrics.errors += 1;
                    }
                    None => {
                        instance.status = PluginStatus::Unloaded;
                        instance.last_error = None;
                    }
                }
            }
        }

        match hook_error {
            Some(message) => {
                self.inner
                    .audit
                    .append(id, AuditAction::Unloaded, json!({ "error": message.clone() }))
                    .await;
                self.inner.events.emit(PluginEvent::PluginError {
                    id: id.to_string(),
                    error: message,
                });
            }
            None => {
                self.inner
                    .audit
                    .append(id, AuditAction::Unloaded, Value::Null)
                    .await;
                self.inner
                    .events
                    .emit(PluginEvent::PluginUnloaded { id: id.to_string() });
            }
        }
        Ok(())
    }

    /// Enable a plugin. From `disabled` this runs `onEnable` and keeps the
    /// existing sandbox; from `unloaded` it performs a full load first.
    pub async fn enable_plugin(&self, id: &str) -> Result<()> {
        let (manifest, status) = self.instance_state(id).await?;
        match status {
            PluginStatus::Loaded | PluginStatus::Loading => Ok(()),
            PluginStatus::Disabled => {
                if manifest.declares_hook(HookName::OnEnable) {
                    if let Err(error) = self
                        .inner
                        .sandbox
                        .invoke_hook(id, HookName::OnEnable, Value::Null)
                        .await
                    {
                        let error: PluginError = error.into();
                        self.inner
                            .fail_plugin(id, &error, AuditAction::CallFailed)
                            .await;
                        return Err(error);
                    }
                }
                self.set_status(id, PluginStatus::Loaded).await;
                self.inner
                    .audit
                    .append(id, AuditAction::Enabled, Value::Null)
                    .await;
                self.inner
                    .events
                    .emit(PluginEvent::PluginEnabled { id: id.to_string() });
                Ok(())
            }
            PluginStatus::Unloaded => {
                self.load_plugin(id).await?;
                self.inner
                    .audit
                    .append(id, AuditAction::Enabled, Value::Null)
                    .await;
                self.inner
                    .events
                    .emit(PluginEvent::PluginEnabled { id: id.to_string() });
                Ok(())
            }
            PluginStatus::Error => Err(PluginError::NotLoaded(id.to_string())),
        }
    }

    /// Disable a plugin without destroying its sandbox state.
    pub async fn disable_plugin(&self, id: &str) -> Result<()> {
        let (manifest, status) = self.instance_state(id).await?;
        match status {
            PluginStatus::Disabled => Ok(()),
            PluginStatus::Loaded => {
                if manifest.declares_hook(HookName::OnDisable) {
                    if let Err(error) = self
                        .inner
                        .sandbox
                        .invoke_hook(id, HookName::OnDisable, Value::Null)
                        .await
                    {
                        let error: PluginError = error.into();
                        self.inner
                            .fail_plugin(id, &error, AuditAction::CallFailed)
                            .await;
                        return Err(error);
                    }
                }
                self.set_status(id, PluginStatus::Disabled).await;
                self.inner
                    .audit
                    .append(id, AuditAction::Disabled, Value::Null)
                    .await;
                self.inner
                    .events
                    .emit(PluginEvent::PluginDisabled { id: id.to_string() });
                Ok(())
            }
            _ => Err(PluginError::NotLoaded(id.to_string())),
        }
    }

    /// Invoke an exported method on a loaded plugin.
    ///
    /// Timeouts and execution failures force the plugin into the `error`
    /// status; the sandbox is replaced on the next explicit load.
    pub async fn call_plugin(&self, id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        {
            let plugins = self.inner.plugins.read().await;
            let instance = plugins
                .get(id)
                .ok_or_else(|| PluginError::ManifestNotFound(id.to_string()))?;
            if instance.status != PluginStatus::Loaded {
                return Err(PluginError::NotLoaded(id.to_string()));
            }
            if !instance.exports.contains(method) {
                return Err(PluginError::UnknownMethod {
                    plugin: id.to_string(),
                    method: method.to_string(),
                });
            }
        }

        match self.inner.sandbox.call_method(id, method, args).await {
            Ok(value) => {
                self.inner.bump_api_call(id, false).await;
                self.inner
                    .audit
                    .append(id, AuditAction::MethodCalled, json!({ "method": method }))
                    .await;
                Ok(value)
            }
            Err(error) => {
                let error: PluginError = error.into();
                if error.is_fatal() {
                    self.inner
                        .fail_plugin(id, &error, AuditAction::CallFailed)
                        .await;
                } else {
                    self.inner.bump_api_call(id, true).await;
                    self.inner
                        .audit
                        .append(
                            id,
                            AuditAction::CallFailed,
                            json!({ "method": method, "error": error.to_string() }),
                        )
                        .await;
                }
                Err(error)
            }
        }
    }

    /// Fetch a manifest and its entry point from the configured repository,
    /// register it `unloaded`, and load it when auto-load is configured.
    pub async fn install_plugin(&self, id: &str) -> Result<()> {
        let manifest = updater::fetch_manifest(&self.inner, id).await?;
        if manifest.id != id {
            return Err(PluginError::Repository(format!(
                "repository returned manifest '{}' for plugin '{id}'",
                manifest.id
            )));
        }
        let code = updater::fetch_code(&self.inner, &manifest).await?;
        let version = manifest.version.clone();
        self.register_plugin(manifest, code).await?;
        self.inner
            .audit
            .append(id, AuditAction::Installed, json!({ "version": version }))
            .await;
        self.inner.events.emit(PluginEvent::PluginInstalled {
            id: id.to_string(),
            version,
        });
        if self.inner.config.auto_load_installed {
            self.load_plugin(id).await?;
        }
        Ok(())
    }

    /// Replace a plugin's configuration value and run `onConfigChange` when
    /// the plugin is loaded. Cached permission decisions are dropped.
    pub async fn set_plugin_config(&self, id: &str, value: Value) -> Result<()> {
        let (manifest, status) = {
            let mut plugins = self.inner.plugins.write().await;
            let instance = plugins
                .get_mut(id)
                .ok_or_else(|| PluginError::ManifestNotFound(id.to_string()))?;
            instance.config = value.clone();
            (Arc::clone(&instance.manifest), instance.status)
        };
        self.inner.permissions.invalidate(id).await;
        if status == PluginStatus::Loaded && manifest.declares_hook(HookName::OnConfigChange) {
            if let Err(error) = self
                .inner
                .sandbox
                .invoke_hook(id, HookName::OnConfigChange, value)
                .await
            {
                let error: PluginError = error.into();
                self.inner
                    .fail_plugin(id, &error, AuditAction::CallFailed)
                    .await;
                return Err(error);
            }
            self.inner
                .audit
                .append(
                    id,
                    AuditAction::HookInvoked,
                    json!({ "hook": HookName::OnConfigChange.as_str() }),
                )
                .await;
        }
        Ok(())
    }

    /// Deliver a message to a plugin's `onMessage` hook. Plugins that do not
    /// declare the hook ignore the message.
    pub async fn notify_plugin(&self, id: &str, message: Value) -> Result<Value> {
        let (manifest, status) = self.instance_state(id).await?;
        if status != PluginStatus::Loaded {
            return Err(PluginError::NotLoaded(id.to_string()));
        }
        if !manifest.declares_hook(HookName::OnMessage) {
            return Ok(Value::Null);
        }
        match self
            .inner
            .sandbox
            .invoke_hook(id, HookName::OnMessage, message)
            .await
        {
            Ok(value) => {
                self.inner
                    .audit
                    .append(
                        id,
                        AuditAction::HookInvoked,
                        json!({ "hook": HookName::OnMessage.as_str() }),
                    )
                    .await;
                Ok(value)
            }
            Err(error) => {
                let error: PluginError = error.into();
                if error.is_fatal() {
                    self.inner
                        .fail_plugin(id, &error, AuditAction::CallFailed)
                        .await;
                }
                Err(error)
            }
        }
    }

    /// Fan a system event out to every loaded plugin, best-effort.
    pub async fn broadcast_event(&self, name: &str, payload: &Value) {
        let targets: Vec<String> = {
            let plugins = self.inner.plugins.read().await;
            plugins
                .values()
                .filter(|instance| instance.status == PluginStatus::Loaded)
                .map(|instance| instance.manifest.id.clone())
                .collect()
        };
        self.inner.sandbox.broadcast_event(&targets, name, payload).await;
    }

    /// Current status of one plugin.
    pub async fn get_plugin_status(&self, id: &str) -> Option<PluginStatus> {
        self.inner
            .plugins
            .read()
            .await
            .get(id)
            .map(|instance| instance.status)
    }

    /// Summaries of every registered plugin.
    pub async fn get_all_plugins(&self) -> Vec<PluginSummary> {
        let plugins = self.inner.plugins.read().await;
        let mut summaries: Vec<PluginSummary> = plugins
            .values()
            .map(|instance| PluginSummary {
                id: instance.manifest.id.clone(),
                name: instance.manifest.name.clone(),
                version: instance.manifest.version.clone(),
                status: instance.status,
                error: instance.last_error.clone(),
                metrics: instance.metrics,
                exports: instance.exports.iter().cloned().collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Audit entries, optionally filtered by plugin id.
    pub async fn get_audit_log(&self, plugin_id: Option<&str>) -> Vec<AuditEntry> {
        self.inner.audit.query(plugin_id).await
    }

    /// Subscribe to registry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.inner.events.subscribe()
    }

    /// Tear the whole host down: stop the poller, unload every plugin and
    /// drop all per-plugin state.
    pub async fn destroy(&self) {
        if let Some(handle) = self.inner.tasks.lock().await.updater.take() {
            handle.abort();
        }
        let ids: Vec<String> = self.inner.plugins.read().await.keys().cloned().collect();
        for id in &ids {
            if let Err(error) = self.unload_plugin(id).await {
                tracing::warn!(plugin = %id, %error, "unload during destroy failed");
            }
            self.inner.storage.remove_plugin(id).await;
        }
        self.inner.plugins.write().await.clear();
        self.inner
            .audit
            .append("host", AuditAction::Destroyed, Value::Null)
            .await;
        tracing::info!(plugins = ids.len(), "plugin host destroyed");
    }

    async fn instance_state(&self, id: &str) -> Result<(Arc<PluginManifest>, PluginStatus)> {
        let plugins = self.inner.plugins.read().await;
        let instance = plugins
            .get(id)
            .ok_or_else(|| PluginError::ManifestNotFound(id.to_string()))?;
        Ok((Arc::clone(&instance.manifest), instance.status))
    }

    async fn set_status(&self, id: &str, status: PluginStatus) {
        if let Some(instance) = self.inner.plugins.write().await.get_mut(id) {
            instance.status = status;
        }
    }
}
