//! Typed host events.
//!
//! The registry publishes these on a broadcast bus instead of a string-keyed
//! emitter; the serialized `event` tag keeps the original kebab-case names
//! for collaborators that forward events over the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Notifications published by the plugin registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PluginEvent {
    PluginLoaded {
        id: String,
    },
    PluginUnloaded {
        id: String,
    },
    PluginEnabled {
        id: String,
    },
    PluginDisabled {
        id: String,
    },
    PluginError {
        id: String,
        error: String,
    },
    /// A mediated action surfaced by a plugin (UI notifications, custom
    /// events emitted through the context API).
    PluginAction {
        id: String,
        name: String,
        payload: Value,
    },
    PluginUpdateAvailable {
        id: String,
        installed: String,
        available: String,
    },
    PluginInstalled {
        id: String,
        version: String,
    },
}

impl PluginEvent {
    /// Id of the plugin the event concerns.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        match self {
            PluginEvent::PluginLoaded { id }
            | PluginEvent::PluginUnloaded { id }
            | PluginEvent::PluginEnabled { id }
            | PluginEvent::PluginDisabled { id }
            | PluginEvent::PluginError { id, .. }
            | PluginEvent::PluginAction { id, .. }
            | PluginEvent::PluginUpdateAvailable { id, .. }
            | PluginEvent::PluginInstalled { id, .. } => id,
        }
    }

    /// Wire name of the event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PluginEvent::PluginLoaded { .. } => "plugin-loaded",
            PluginEvent::PluginUnloaded { .. } => "plugin-unloaded",
            PluginEvent::PluginEnabled { .. } => "plugin-enabled",
            PluginEvent::PluginDisabled { .. } => "plugin-disabled",
            PluginEvent::PluginError { .. } => "plugin-error",
            PluginEvent::PluginAction { .. } => "plugin-action",
            PluginEvent::PluginUpdateAvailable { .. } => "plugin-update-available",
            PluginEvent::PluginInstalled { .. } => "plugin-installed",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let event = PluginEvent::PluginUpdateAvailable {
            id: "weather".into(),
            installed: "1.0.0".into(),
            available: "1.1.0".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "plugin-update-available");
        assert_eq!(event.kind(), "plugin-update-available");
    }

    #[test]
    fn plugin_id_is_reachable_for_every_kind() {
        let event = PluginEvent::PluginError {
            id: "notes".into(),
            error: "onLoad threw".into(),
        };
        assert_eq!(event.plugin_id(), "notes");
    }
}
