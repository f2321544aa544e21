//! Typed capability grants and capability descriptors.
//!
//! Manifests declare grants in the original wire shape (`true | false |
//! [list]` per category); mediated calls request a [`Capability`], a tagged
//! variant carrying its own payload so the evaluator can match exhaustively
//! instead of parsing `"category.action"` strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default byte cap for a plugin's local store (1 MiB).
pub const DEFAULT_STORAGE_SIZE: u64 = 1024 * 1024;

/// Grant over a class of external resources: everything, nothing, or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeGrant {
    /// `true` grants every resource, `false` grants none.
    Unrestricted(bool),
    /// Only the listed resources are granted.
    Allowlist(Vec<String>),
}

impl ScopeGrant {
    /// Evaluate the grant against a concrete resource.
    ///
    /// `matches` decides how a list entry covers a resource (domain
    /// containment for network, path prefix for filesystem). A list grant
    /// with no resource to check is a denial.
    pub fn allows<F>(&self, resource: Option<&str>, matches: F) -> bool
    where
        F: Fn(&str, &str) -> bool,
    {
        match self {
            ScopeGrant::Unrestricted(all) => *all,
            ScopeGrant::Allowlist(entries) => match resource {
                Some(resource) => entries.iter().any(|entry| matches(resource, entry)),
                None => false,
            },
        }
    }
}

/// Bounded local storage grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGrant {
    /// Whether the plugin may use local storage at all.
    #[serde(default)]
    pub local: bool,
    /// Byte cap for the plugin's store.
    #[serde(default = "default_storage_size")]
    pub size: u64,
}

fn default_storage_size() -> u64 {
    DEFAULT_STORAGE_SIZE
}

impl Default for StorageGrant {
    fn default() -> Self {
        Self {
            local: false,
            size: DEFAULT_STORAGE_SIZE,
        }
    }
}

/// Capability grants declared by a manifest.
///
/// Every field is optional; an absent field denies its category, and an
/// absent `permissions` block altogether defers to the host-wide
/// default-allow flag (handled by the evaluator, not here).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<ScopeGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<ScopeGrant>,
    /// Named system capabilities, matched against `Capability::System`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<String>>,
    /// Peer plugin ids this plugin may call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageGrant>,
}

impl PermissionSpec {
    /// Pure grant decision for one capability against this spec.
    #[must_use]
    pub fn grants(&self, capability: &Capability) -> bool {
        match capability {
            Capability::Network { domain } => self
                .network
                .as_ref()
                .is_some_and(|grant| grant.allows(domain.as_deref(), |res, entry| res.contains(entry))),
            Capability::Filesystem { path } => self
                .filesystem
                .as_ref()
                .is_some_and(|grant| grant.allows(path.as_deref(), |res, entry| res.starts_with(entry))),
            Capability::System { action } => self
                .system
                .as_ref()
                .is_some_and(|actions| actions.iter().any(|a| a == action)),
            Capability::PeerCall { peer } => self
                .plugins
                .as_ref()
                .is_some_and(|peers| peers.iter().any(|p| p == peer)),
            Capability::Ui => self.ui == Some(true),
            Capability::StorageLocal => self.storage.as_ref().is_some_and(|s| s.local),
        }
    }

    /// Declared storage byte cap, defaulting to 1 MiB.
    #[must_use]
    pub fn storage_cap(&self) -> u64 {
        self.storage.as_ref().map_or(DEFAULT_STORAGE_SIZE, |s| s.size)
    }
}

/// A concrete capability requested by a mediated call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Outbound network access, optionally to a specific domain.
    Network { domain: Option<String> },
    /// Filesystem access, optionally to a specific path.
    Filesystem { path: Option<String> },
    /// A named system capability such as `clipboard` or `notifications`.
    System { action: String },
    /// Calling an exported method of a peer plugin.
    PeerCall { peer: String },
    /// Rendering or notifying through the host UI surface.
    Ui,
    /// The plugin's bounded local key/value store.
    StorageLocal,
}

impl Capability {
    /// Canonical `category.action` string carried by denial errors and audit
    /// entries.
    #[must_use]
    pub fn permission(&self) -> String {
        match self {
            Capability::Network { .. } => "network.fetch".to_string(),
            Capability::Filesystem { .. } => "filesystem.access".to_string(),
            Capability::System { action } => format!("system.{action}"),
            Capability::PeerCall { .. } => "plugins.call".to_string(),
            Capability::Ui => "ui.render".to_string(),
            Capability::StorageLocal => "storage.local".to_string(),
        }
    }

    /// The concrete resource the capability targets, if any.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        match self {
            Capability::Network { domain } => domain.as_deref(),
            Capability::Filesystem { path } => path.as_deref(),
            Capability::PeerCall { peer } => Some(peer.as_str()),
            Capability::System { .. } | Capability::Ui | Capability::StorageLocal => None,
        }
    }

    /// Stable key for the evaluator's decision cache.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self.resource() {
            Some(resource) => format!("{}\u{1f}{resource}", self.permission()),
            None => self.permission(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource() {
            Some(resource) => write!(f, "{}({resource})", self.permission()),
            None => f.write_str(&self.permission()),
        }
    }
}
