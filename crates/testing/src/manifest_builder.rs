//! Terse manifest construction for tests.

use std::collections::{BTreeMap, BTreeSet};

use dplug_protocol::{CodeType, HookName, PermissionSpec, PluginManifest};

/// Start building a manifest with sensible test defaults.
#[must_use]
pub fn manifest(id: &str) -> ManifestBuilder {
    ManifestBuilder {
        manifest: PluginManifest {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            main: "index.js".to_string(),
            code_type: CodeType::Script,
            dependencies: BTreeMap::new(),
            permissions: None,
            hooks: BTreeSet::new(),
            exports: BTreeSet::new(),
            config_schema: None,
        },
    }
}

/// Builder returned by [`manifest`].
pub struct ManifestBuilder {
    manifest: PluginManifest,
}

impl ManifestBuilder {
    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.manifest.version = version.to_string();
        self
    }

    #[must_use]
    pub fn main(mut self, main: &str) -> Self {
        self.manifest.main = main.to_string();
        self
    }

    #[must_use]
    pub fn code_type(mut self, code_type: CodeType) -> Self {
        self.manifest.code_type = code_type;
        self
    }

    /// Set the permission block from its JSON wire shape.
    ///
    /// # Panics
    /// Panics on malformed JSON; this is test-only code.
    #[must_use]
    pub fn permissions(mut self, json: &str) -> Self {
        let spec: PermissionSpec = serde_json::from_str(json).unwrap();
        self.manifest.permissions = Some(spec);
        self
    }

    #[must_use]
    pub fn hook(mut self, hook: HookName) -> Self {
        self.manifest.hooks.insert(hook);
        self
    }

    #[must_use]
    pub fn export(mut self, name: &str) -> Self {
        self.manifest.exports.insert(name.to_string());
        self
    }

    #[must_use]
    pub fn dependency(mut self, id: &str, range: &str) -> Self {
        self.manifest
            .dependencies
            .insert(id.to_string(), range.to_string());
        self
    }

    #[must_use]
    pub fn build(self) -> PluginManifest {
        self.manifest
    }
}
