//! Per-plugin bounded key/value storage.
//!
//! Writes are charged by serialized size and checked against the plugin's
//! declared cap before any mutation: an over-quota `set` leaves the existing
//! value set untouched. Reads, deletes and clears are plain passthroughs
//! scoped to the plugin.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::PluginError;

#[derive(Default)]
struct PluginStore {
    entries: HashMap<String, Value>,
    used: u64,
}

/// Quota-enforcing store for every plugin on a host.
pub struct StorageQuotaManager {
    stores: Mutex<HashMap<String, PluginStore>>,
}

impl StorageQuotaManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Write `value` under `key`, rejecting before mutation when
    /// `current_total + serialized_size(value)` exceeds `cap`.
    pub async fn set(
        &self,
        plugin_id: &str,
        cap: u64,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), PluginError> {
        let size = serialized_size(&value)?;
        let mut stores = self.stores.lock().await;
        let store = stores.entry(plugin_id.to_string()).or_default();
        if store.used + size > cap {
            return Err(PluginError::StorageQuotaExceeded {
                plugin: plugin_id.to_string(),
                requested: size,
                limit: cap,
            });
        }
        if let Some(previous) = store.entries.insert(key.into(), value) {
            store.used -= serialized_size(&previous)?;
        }
        store.used += size;
        Ok(())
    }

    /// Read a value. `None` when the key was never written.
    pub async fn get(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.stores
            .lock()
            .await
            .get(plugin_id)
            .and_then(|store| store.entries.get(key).cloned())
    }

    /// Delete a key; returns whether it existed.
    pub async fn delete(&self, plugin_id: &str, key: &str) -> bool {
        let mut stores = self.stores.lock().await;
        let Some(store) = stores.get_mut(plugin_id) else {
            return false;
        };
        match store.entries.remove(key) {
            Some(previous) => {
                store.used -= serialized_size(&previous).unwrap_or(0);
                true
            }
            None => false,
        }
    }

    /// Drop every key the plugin has written.
    pub async fn clear(&self, plugin_id: &str) {
        if let Some(store) = self.stores.lock().await.get_mut(plugin_id) {
            store.entries.clear();
            store.used = 0;
        }
    }

    /// Bytes currently charged against the plugin's cap.
    pub async fn used(&self, plugin_id: &str) -> u64 {
        self.stores
            .lock()
            .await
            .get(plugin_id)
            .map_or(0, |store| store.used)
    }

    /// Drop the plugin's store entirely. Called when a manifest is removed.
    pub async fn remove_plugin(&self, plugin_id: &str) {
        self.stores.lock().await.remove(plugin_id);
    }
}

impl Default for StorageQuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

fn serialized_size(value: &Value) -> Result<u64, PluginError> {
    Ok(serde_json::to_string(value)?.len() as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const CAP: u64 = 64;

    #[tokio::test]
    async fn writes_within_cap_accumulate() {
        let storage = StorageQuotaManager::new();
        storage.set("p", CAP, "a", json!("xx")).await.unwrap();
        storage.set("p", CAP, "b", json!("yy")).await.unwrap();
        assert_eq!(storage.get("p", "a").await, Some(json!("xx")));
        assert_eq!(storage.used("p").await, 8); // two 4-byte serialized strings
    }

    #[tokio::test]
    async fn over_quota_write_leaves_prior_value_untouched() {
        let storage = StorageQuotaManager::new();
        storage.set("p", CAP, "key", json!("small")).await.unwrap();

        let big = json!("x".repeat(128));
        let outcome = storage.set("p", CAP, "key", big).await;
        match outcome {
            Err(PluginError::StorageQuotaExceeded { limit, .. }) => assert_eq!(limit, CAP),
            other => panic!("expected quota rejection, got {other:?}"),
        }
        // No partial mutation.
        assert_eq!(storage.get("p", "key").await, Some(json!("small")));
    }

    #[tokio::test]
    async fn over_quota_write_to_fresh_key_returns_none_on_read() {
        let storage = StorageQuotaManager::new();
        let outcome = storage.set("p", 4, "huge", json!("oversized")).await;
        assert!(outcome.is_err());
        assert_eq!(storage.get("p", "huge").await, None);
    }

    #[tokio::test]
    async fn delete_refunds_quota() {
        let storage = StorageQuotaManager::new();
        storage.set("p", CAP, "a", json!("data")).await.unwrap();
        assert!(storage.delete("p", "a").await);
        assert!(!storage.delete("p", "a").await);
        assert_eq!(storage.used("p").await, 0);
    }

    #[tokio::test]
    async fn clear_resets_the_plugin_scope_only() {
        let storage = StorageQuotaManager::new();
        storage.set("p", CAP, "a", json!(1)).await.unwrap();
        storage.set("q", CAP, "a", json!(2)).await.unwrap();
        storage.clear("p").await;
        assert_eq!(storage.get("p", "a").await, None);
        assert_eq!(storage.get("q", "a").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn overwrite_charges_the_new_size() {
        let storage = StorageQuotaManager::new();
        storage.set("p", CAP, "k", json!("aaaaaaaa")).await.unwrap();
        let first = storage.used("p").await;
        storage.set("p", CAP, "k", json!("b")).await.unwrap();
        assert!(storage.used("p").await < first);
    }
}
