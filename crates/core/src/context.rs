//! Mediated context: the host side of a plugin's API surface.
//!
//! Every isolate gets one dispatcher task servicing its sandbox→host
//! stream. Responses complete the broker's pending requests, log lines go to
//! tracing under the plugin's name, and mediated [`HostCall`]s are
//! permission-checked and executed, each on its own task so a slow fetch or
//! timer never stalls response routing for the same plugin.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dplug_protocol::{Capability, HostCall, LogLevel, PluginEvent, SandboxMessage};

use crate::audit::AuditAction;
use crate::registry::{PluginRegistry, RegistryInner};

/// Spawn the dispatcher for one plugin's sandbox→host stream.
///
/// The task ends when the isolate is terminated (the stream closes) or the
/// registry is dropped.
pub(crate) fn spawn_dispatcher(
    registry: Weak<RegistryInner>,
    plugin_id: String,
    mut stream: mpsc::Receiver<SandboxMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = stream.recv().await {
            let Some(inner) = registry.upgrade() else {
                break;
            };
            match message {
                SandboxMessage::Response {
                    request_id,
                    success,
                    result,
                    error,
                } => {
                    inner
                        .sandbox
                        .broker()
                        .complete(request_id, success, result, error)
                        .await;
                }
                SandboxMessage::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!(plugin = %plugin_id, "{message}"),
                    LogLevel::Info => tracing::info!(plugin = %plugin_id, "{message}"),
                    LogLevel::Warn => tracing::warn!(plugin = %plugin_id, "{message}"),
                    LogLevel::Error => tracing::error!(plugin = %plugin_id, "{message}"),
                },
                SandboxMessage::Request { request_id, call } => {
                    let plugin_id = plugin_id.clone();
                    tokio::spawn(async move {
                        let outcome = handle_host_call(&inner, &plugin_id, call).await;
                        inner.bump_api_call(&plugin_id, outcome.is_err()).await;
                        if let Err(error) = inner
                            .sandbox
                            .deliver_response(&plugin_id, request_id, outcome)
                            .await
                        {
                            tracing::debug!(
                                plugin = %plugin_id,
                                %error,
                                "failed to deliver mediated reply"
                            );
                        }
                    });
                }
            }
        }
        tracing::debug!(plugin = %plugin_id, "context dispatcher stopped");
    })
}

/// Execute one mediated call on behalf of `plugin_id`.
///
/// Errors are returned to the plugin as strings: permission denials and
/// quota rejections are recoverable inside plugin code.
async fn handle_host_call(
    inner: &Arc<RegistryInner>,
    plugin_id: &str,
    call: HostCall,
) -> Result<Value, String> {
    let Some((spec, storage_cap)) = inner.permission_context(plugin_id).await else {
        return Err(format!("plugin '{plugin_id}' is not registered"));
    };
    let spec = spec.as_ref();

    match call {
        HostCall::StorageGet { key } => {
            check(inner, plugin_id, spec, &Capability::StorageLocal).await?;
            Ok(inner
                .storage
                .get(plugin_id, &key)
                .await
                .unwrap_or(Value::Null))
        }
        HostCall::StorageSet { key, value } => {
            check(inner, plugin_id, spec, &Capability::StorageLocal).await?;
            match inner.storage.set(plugin_id, storage_cap, key, value).await {
                Ok(()) => Ok(Value::Bool(true)),
                Err(error) => {
                    inner
                        .audit
                        .append(
                            plugin_id,
                            AuditAction::StorageRejected,
                            json!({ "error": error.to_string() }),
                        )
                        .await;
                    Err(error.to_string())
                }
            }
        }
        HostCall::StorageDelete { key } => {
            check(inner, plugin_id, spec, &Capability::StorageLocal).await?;
            Ok(json!(inner.storage.delete(plugin_id, &key).await))
        }
        HostCall::StorageClear => {
            check(inner, plugin_id, spec, &Capability::StorageLocal).await?;
            inner.storage.clear(plugin_id).await;
            Ok(Value::Bool(true))
        }
        HostCall::NetFetch { url } => {
            let capability = Capability::Network {
                domain: Some(url.clone()),
            };
            check(inner, plugin_id, spec, &capability).await?;
            let response = inner
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| format!("fetch failed: {e}"))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| format!("fetch failed: {e}"))?;
            Ok(json!({ "status": status, "body": body }))
        }
        HostCall::PeerCall {
            plugin,
            method,
            args,
        } => {
            let capability = Capability::PeerCall {
                peer: plugin.clone(),
            };
            check(inner, plugin_id, spec, &capability).await?;
            let registry = PluginRegistry::from_inner(Arc::clone(inner));
            registry
                .call_plugin(&plugin, &method, args)
                .await
                .map_err(|e| e.to_string())
        }
        HostCall::UiNotify { message } => {
            check(inner, plugin_id, spec, &Capability::Ui).await?;
            inner
                .audit
                .append(plugin_id, AuditAction::ActionEmitted, json!({ "name": "ui.notify" }))
                .await;
            inner.events.emit(PluginEvent::PluginAction {
                id: plugin_id.to_string(),
                name: "ui.notify".to_string(),
                payload: json!(message),
            });
            Ok(Value::Bool(true))
        }
        HostCall::Sleep { delay_ms } => {
            let clamped = clamp_delay(delay_ms, inner.config.sandbox_timeout);
            tokio::time::sleep(Duration::from_millis(clamped)).await;
            Ok(json!(clamped))
        }
        HostCall::Emit { name, payload } => {
            inner
                .audit
                .append(plugin_id, AuditAction::ActionEmitted, json!({ "name": name }))
                .await;
            inner.events.emit(PluginEvent::PluginAction {
                id: plugin_id.to_string(),
                name,
                payload,
            });
            Ok(Value::Bool(true))
        }
    }
}

/// A mediated timer never outlives the sandbox timeout.
fn clamp_delay(requested_ms: u64, limit: Duration) -> u64 {
    requested_ms.min(limit.as_millis() as u64)
}

async fn check(
    inner: &Arc<RegistryInner>,
    plugin_id: &str,
    spec: Option<&dplug_protocol::PermissionSpec>,
    capability: &Capability,
) -> Result<(), String> {
    match inner.permissions.check(plugin_id, spec, capability).await {
        Ok(()) => Ok(()),
        Err(error) => {
            inner
                .audit
                .append(
                    plugin_id,
                    AuditAction::PermissionDenied,
                    json!({ "permission": capability.permission() }),
                )
                .await;
            tracing::warn!(
                plugin = %plugin_id,
                permission = %capability.permission(),
                "mediated call denied"
            );
            Err(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_are_clamped_to_the_sandbox_timeout() {
        let limit = Duration::from_secs(30);
        assert_eq!(clamp_delay(1_000, limit), 1_000);
        assert_eq!(clamp_delay(120_000, limit), 30_000);
        assert_eq!(clamp_delay(0, limit), 0);
    }
}
