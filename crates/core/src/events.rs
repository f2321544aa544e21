//! Typed event bus.
//!
//! The registry publishes [`PluginEvent`]s on a broadcast channel owned by
//! the host aggregate; collaborators subscribe and receive every event
//! emitted after their subscription. Emission is fire-and-forget; a bus
//! with no subscribers drops events silently.

use tokio::sync::broadcast;

use dplug_protocol::PluginEvent;

const EVENT_BUS_CAPACITY: usize = 256;

/// Broadcast channel for registry events.
pub struct EventBus {
    sender: broadcast::Sender<PluginEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: PluginEvent) {
        tracing::debug!(
            event = event.kind(),
            plugin = event.plugin_id(),
            "plugin event"
        );
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
