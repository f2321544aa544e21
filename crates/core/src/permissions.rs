//! Permission evaluation and the per-instance decision cache.
//!
//! The grant decision itself is pure, a function of the manifest's
//! permission block, the requested capability and the host-wide
//! default-allow flag, so decisions are cacheable per
//! `(plugin, capability, resource)` until the owning plugin is unloaded.

use std::collections::HashMap;

use tokio::sync::Mutex;

use dplug_protocol::{Capability, PermissionSpec};

use crate::error::PluginError;

/// Pure grant decision. A plugin with no `permissions` block falls back to
/// the host-wide default-allow flag.
#[must_use]
pub fn evaluate(spec: Option<&PermissionSpec>, capability: &Capability, default_allow: bool) -> bool {
    match spec {
        Some(spec) => spec.grants(capability),
        None => default_allow,
    }
}

/// Caching wrapper around [`evaluate`].
pub struct PermissionEvaluator {
    default_allow: bool,
    cache: Mutex<HashMap<String, HashMap<String, bool>>>,
}

impl PermissionEvaluator {
    #[must_use]
    pub fn new(default_allow: bool) -> Self {
        Self {
            default_allow,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `plugin_id` holds `capability`, consulting the cache
    /// first.
    pub async fn decide(
        &self,
        plugin_id: &str,
        spec: Option<&PermissionSpec>,
        capability: &Capability,
    ) -> bool {
        let key = capability.cache_key();
        let mut cache = self.cache.lock().await;
        let decisions = cache.entry(plugin_id.to_string()).or_default();
        if let Some(&decision) = decisions.get(&key) {
            return decision;
        }
        let decision = evaluate(spec, capability, self.default_allow);
        decisions.insert(key, decision);
        decision
    }

    /// Like [`Self::decide`], but a denial becomes a typed error carrying
    /// the canonical permission string, never a silent no-op.
    pub async fn check(
        &self,
        plugin_id: &str,
        spec: Option<&PermissionSpec>,
        capability: &Capability,
    ) -> Result<(), PluginError> {
        if self.decide(plugin_id, spec, capability).await {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                permission: capability.permission(),
            })
        }
    }

    /// Drop every cached decision for a plugin. Called on unload and on
    /// config replacement.
    pub async fn invalidate(&self, plugin_id: &str) {
        if self.cache.lock().await.remove(plugin_id).is_some() {
            tracing::debug!(plugin = %plugin_id, "permission cache invalidated");
        }
    }

    /// Number of cached decisions for a plugin.
    pub async fn cached_decisions(&self, plugin_id: &str) -> usize {
        self.cache
            .lock()
            .await
            .get(plugin_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn network_spec() -> PermissionSpec {
        serde_json::from_str(r#"{"network":["example.com"]}"#).unwrap()
    }

    fn fetch(domain: &str) -> Capability {
        Capability::Network {
            domain: Some(domain.to_string()),
        }
    }

    #[tokio::test]
    async fn repeated_checks_are_deterministic() {
        let evaluator = PermissionEvaluator::new(false);
        let spec = network_spec();
        for _ in 0..3 {
            assert!(
                evaluator
                    .decide("p", Some(&spec), &fetch("https://example.com/api"))
                    .await
            );
            assert!(!evaluator.decide("p", Some(&spec), &fetch("https://evil.com")).await);
        }
        assert_eq!(evaluator.cached_decisions("p").await, 2);
    }

    #[tokio::test]
    async fn denial_carries_the_permission_string() {
        let evaluator = PermissionEvaluator::new(false);
        let outcome = evaluator.check("p", None, &Capability::Ui).await;
        match outcome {
            Err(PluginError::PermissionDenied { permission }) => {
                assert_eq!(permission, "ui.render");
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_permission_block_uses_default_allow() {
        let permissive = PermissionEvaluator::new(true);
        assert!(permissive.decide("p", None, &Capability::StorageLocal).await);

        let restrictive = PermissionEvaluator::new(false);
        assert!(!restrictive.decide("p", None, &Capability::StorageLocal).await);
    }

    #[tokio::test]
    async fn invalidate_drops_only_the_named_plugin() {
        let evaluator = PermissionEvaluator::new(false);
        let spec = network_spec();
        evaluator.decide("a", Some(&spec), &fetch("https://example.com")).await;
        evaluator.decide("b", Some(&spec), &fetch("https://example.com")).await;

        evaluator.invalidate("a").await;
        assert_eq!(evaluator.cached_decisions("a").await, 0);
        assert_eq!(evaluator.cached_decisions("b").await, 1);
    }
}
