//! Host configuration.

use std::time::Duration;

use dplug_sandbox::{IsolationLevel, SandboxConfig};

/// Default interval between repository update polls.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default capacity of the audit ring.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Configuration for a plugin host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Isolation level applied to every sandbox.
    pub isolation: IsolationLevel,
    /// Bound on load and call round-trips; also clamps mediated timers.
    pub sandbox_timeout: Duration,
    /// Grant decision for plugins that declare no `permissions` block.
    pub default_allow: bool,
    /// Base URL of the plugin repository, e.g. `https://plugins.example.com`.
    /// `None` disables installs and update polling.
    pub repository_url: Option<String>,
    /// Load plugins immediately after `install_plugin` registers them.
    pub auto_load_installed: bool,
    /// Interval between repository update polls.
    pub update_interval: Duration,
    /// Capacity of the audit ring.
    pub audit_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Basic,
            sandbox_timeout: Duration::from_secs(30),
            default_allow: false,
            repository_url: None,
            auto_load_installed: false,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl HostConfig {
    /// Short timeouts and fast polling for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            isolation: IsolationLevel::None,
            sandbox_timeout: Duration::from_millis(500),
            update_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Set the repository base URL.
    #[must_use]
    pub fn with_repository_url(mut self, url: impl Into<String>) -> Self {
        self.repository_url = Some(url.into());
        self
    }

    /// Set the isolation level.
    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the host-wide default-allow flag.
    #[must_use]
    pub fn with_default_allow(mut self, default_allow: bool) -> Self {
        self.default_allow = default_allow;
        self
    }

    /// Enable or disable auto-loading of installed plugins.
    #[must_use]
    pub fn with_auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load_installed = auto_load;
        self
    }

    /// Derive the sandbox layer configuration.
    #[must_use]
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            isolation: self.isolation,
            load_timeout: self.sandbox_timeout,
            call_timeout: self.sandbox_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = HostConfig::default();
        assert_eq!(config.sandbox_timeout, Duration::from_secs(30));
        assert_eq!(config.update_interval, Duration::from_secs(3600));
        assert_eq!(config.audit_capacity, 1000);
        assert!(!config.default_allow);
        assert!(config.repository_url.is_none());
    }

    #[test]
    fn builders_compose() {
        let config = HostConfig::for_testing()
            .with_repository_url("http://localhost:9000")
            .with_default_allow(true)
            .with_auto_load(true);
        assert_eq!(
            config.repository_url.as_deref(),
            Some("http://localhost:9000")
        );
        assert!(config.default_allow);
        assert!(config.auto_load_installed);
    }
}
