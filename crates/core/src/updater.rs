//! Repository client and background update poller.
//!
//! The poller fetches `{repository_url}/plugins.json` on a fixed interval
//! and compares each installed manifest's version against the remote using
//! segment-wise comparison. It only ever notifies; updates are never
//! applied automatically. Fetch and parse failures are logged and swallowed;
//! the next tick retries unconditionally.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use dplug_protocol::{is_newer_version, CodeType, PluginCode, PluginEvent, PluginManifest};

use crate::audit::AuditAction;
use crate::error::PluginError;
use crate::registry::RegistryInner;

/// One entry of the remote `plugins.json` index. Extra fields are ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct RemoteEntry {
    pub id: String,
    pub version: String,
}

/// Spawn the interval poller. The task stops when the registry is dropped.
pub(crate) fn spawn(inner: &Arc<RegistryInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let interval = inner.config.update_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; polling starts one interval in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if let Err(error) = poll_once(&inner).await {
                tracing::warn!(%error, "plugin repository poll failed");
            }
        }
    })
}

/// Fetch the remote index once and emit a notification per outdated plugin.
pub(crate) async fn poll_once(inner: &Arc<RegistryInner>) -> Result<(), PluginError> {
    let Some(base) = inner.config.repository_url.as_deref() else {
        return Ok(());
    };
    let url = format!("{}/plugins.json", base.trim_end_matches('/'));
    let index: Vec<RemoteEntry> = get_json(inner, &url).await?;

    let installed: Vec<(String, String)> = {
        let plugins = inner.plugins.read().await;
        plugins
            .values()
            .map(|instance| (instance.manifest.id.clone(), instance.manifest.version.clone()))
            .collect()
    };

    for entry in index {
        let Some((id, version)) = installed.iter().find(|(id, _)| *id == entry.id) else {
            continue;
        };
        if is_newer_version(&entry.version, version) {
            tracing::info!(
                plugin = %id,
                installed = %version,
                available = %entry.version,
                "plugin update available"
            );
            inner
                .audit
                .append(
                    id,
                    AuditAction::UpdateAvailable,
                    json!({ "installed": version, "available": entry.version }),
                )
                .await;
            inner.events.emit(PluginEvent::PluginUpdateAvailable {
                id: id.clone(),
                installed: version.clone(),
                available: entry.version,
            });
        }
    }
    Ok(())
}

/// Fetch a single plugin manifest for installation.
pub(crate) async fn fetch_manifest(
    inner: &Arc<RegistryInner>,
    plugin_id: &str,
) -> Result<PluginManifest, PluginError> {
    let base = repository_base(inner)?;
    let url = format!("{base}/plugins/{plugin_id}/manifest.json");
    get_json(inner, &url).await
}

/// Fetch the manifest's entry-point file.
pub(crate) async fn fetch_code(
    inner: &Arc<RegistryInner>,
    manifest: &PluginManifest,
) -> Result<PluginCode, PluginError> {
    let base = repository_base(inner)?;
    let url = format!("{base}/plugins/{}/{}", manifest.id, manifest.main);
    let response = inner
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))?
        .error_for_status()
        .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))?;
    match manifest.code_type {
        CodeType::Script => {
            let text = response
                .text()
                .await
                .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))?;
            Ok(PluginCode::Source(text))
        }
        CodeType::Bytecode => {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))?;
            Ok(PluginCode::Bytes(bytes.to_vec()))
        }
    }
}

fn repository_base(inner: &Arc<RegistryInner>) -> Result<&str, PluginError> {
    inner
        .config
        .repository_url
        .as_deref()
        .map(|base| base.trim_end_matches('/'))
        .ok_or_else(|| PluginError::Repository("no repository configured".to_string()))
}

async fn get_json<T: serde::de::DeserializeOwned>(
    inner: &Arc<RegistryInner>,
    url: &str,
) -> Result<T, PluginError> {
    inner
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))?
        .error_for_status()
        .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))?
        .json()
        .await
        .map_err(|e| PluginError::Repository(format!("GET {url}: {e}")))
}
