//! Plugin manifest model.
//!
//! A manifest is the declarative description of a plugin: identity, entry
//! point, declared capabilities, lifecycle hooks and exported methods.
//! Manifests are immutable once their plugin has been loaded; the registry
//! hands them out behind `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::PermissionSpec;

/// How the plugin's entry point is delivered to the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    /// Plain source text, interpreted by the sandbox executor.
    #[default]
    Script,
    /// Precompiled bytecode, e.g. a WASM module.
    Bytecode,
}

/// Named lifecycle callbacks a plugin may implement.
///
/// Hooks are invoked through the same request/response channel as method
/// calls; a plugin only receives hooks it declared in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HookName {
    #[serde(rename = "onLoad")]
    OnLoad,
    #[serde(rename = "onEnable")]
    OnEnable,
    #[serde(rename = "onDisable")]
    OnDisable,
    #[serde(rename = "onUnload")]
    OnUnload,
    #[serde(rename = "onConfigChange")]
    OnConfigChange,
    #[serde(rename = "onMessage")]
    OnMessage,
}

impl HookName {
    /// Wire name of the hook as it appears in manifests.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::OnLoad => "onLoad",
            HookName::OnEnable => "onEnable",
            HookName::OnDisable => "onDisable",
            HookName::OnUnload => "onUnload",
            HookName::OnConfigChange => "onConfigChange",
            HookName::OnMessage => "onMessage",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry-point payload paired with [`CodeType`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginCode {
    /// Source text for `CodeType::Script`.
    Source(String),
    /// Raw module bytes for `CodeType::Bytecode`.
    Bytes(Vec<u8>),
}

impl PluginCode {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            PluginCode::Source(text) => text.len(),
            PluginCode::Bytes(bytes) => bytes.len(),
        }
    }

    /// True when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PluginCode {
    // Module bytes and source text are noise in logs; show the size only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginCode::Source(text) => write!(f, "PluginCode::Source({} bytes)", text.len()),
            PluginCode::Bytes(bytes) => write!(f, "PluginCode::Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Errors produced by [`PluginManifest::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// A required field is empty.
    #[error("manifest field '{0}' must not be empty")]
    MissingField(&'static str),

    /// The version string has no numeric leading segment.
    #[error("invalid version string: '{0}'")]
    InvalidVersion(String),
}

/// Declarative description of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier.
    pub id: String,
    /// Human-readable plugin name.
    pub name: String,
    /// Semver string, compared segment-wise by the repository updater.
    pub version: String,
    /// Entry-point file name within the plugin package.
    pub main: String,
    /// Delivery format of the entry point.
    #[serde(default, rename = "codeType")]
    pub code_type: CodeType,
    /// Peer plugin ids this plugin depends on, with version ranges.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Declared capability grants. A missing block falls back to the
    /// host-wide default-allow policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSpec>,
    /// Lifecycle hooks the plugin implements.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hooks: BTreeSet<HookName>,
    /// Methods callable through `call_plugin`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exports: BTreeSet<String>,
    /// JSON schema for the plugin's configuration value.
    #[serde(default, rename = "configSchema", skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
}

impl PluginManifest {
    /// Check structural invariants before registration.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::MissingField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if self.main.trim().is_empty() {
            return Err(ManifestError::MissingField("main"));
        }
        // The updater compares versions segment-wise; require at least one
        // numeric leading segment so comparisons are meaningful.
        let leading = self.version.split('.').next().unwrap_or("");
        if leading.parse::<u64>().is_err() {
            return Err(ManifestError::InvalidVersion(self.version.clone()));
        }
        Ok(())
    }

    /// True when the plugin declared the given lifecycle hook.
    #[must_use]
    pub fn declares_hook(&self, hook: HookName) -> bool {
        self.hooks.contains(&hook)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manifest() -> PluginManifest {
        PluginManifest {
            id: "weather".into(),
            name: "Weather Widget".into(),
            version: "1.2.0".into(),
            main: "index.js".into(),
            code_type: CodeType::Script,
            dependencies: BTreeMap::new(),
            permissions: None,
            hooks: BTreeSet::from([HookName::OnLoad, HookName::OnUnload]),
            exports: BTreeSet::from(["getForecast".to_string()]),
            config_schema: None,
        }
    }

    #[test]
    fn manifest_round_trips_with_wire_field_names() {
        let json = serde_json::to_string(&manifest()).unwrap();
        assert!(json.contains("\"onLoad\""));
        let parsed: PluginManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "weather");
        assert!(parsed.declares_hook(HookName::OnUnload));
    }

    #[test]
    fn manifest_defaults_optional_fields() {
        let parsed: PluginManifest = serde_json::from_str(
            r#"{"id":"a","name":"A","version":"1.0.0","main":"a.js"}"#,
        )
        .unwrap();
        assert_eq!(parsed.code_type, CodeType::Script);
        assert!(parsed.hooks.is_empty());
        assert!(parsed.permissions.is_none());
    }

    #[test]
    fn validate_rejects_empty_id() {
        let mut m = manifest();
        m.id = "  ".into();
        assert_eq!(m.validate(), Err(ManifestError::MissingField("id")));
    }

    #[test]
    fn validate_rejects_non_numeric_version() {
        let mut m = manifest();
        m.version = "latest".into();
        assert!(matches!(m.validate(), Err(ManifestError::InvalidVersion(_))));
    }

    #[test]
    fn plugin_code_debug_hides_payload() {
        let code = PluginCode::Source("export function f() {}".into());
        let debug = format!("{code:?}");
        assert!(!debug.contains("export"));
        assert!(debug.contains("bytes"));
    }
}
