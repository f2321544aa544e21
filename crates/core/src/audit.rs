//! Append-only bounded audit trail.
//!
//! Every registry action and security-relevant mediated call lands here:
//! a fixed-capacity FIFO ring, append-only, never mutated in place. The ring
//! keeps the most recent entries and evicts the oldest.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

/// Kinds of recorded actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Registered,
    Removed,
    Loaded,
    LoadFailed,
    Unloaded,
    Enabled,
    Disabled,
    MethodCalled,
    CallFailed,
    HookInvoked,
    PermissionDenied,
    StorageRejected,
    ActionEmitted,
    Installed,
    UpdateAvailable,
    Destroyed,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub plugin_id: String,
    pub action: AuditAction,
    pub details: Value,
}

/// Fixed-capacity FIFO ring of audit entries.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append one entry, evicting the oldest when the ring is full.
    pub async fn append(&self, plugin_id: impl Into<String>, action: AuditAction, details: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            plugin_id: plugin_id.into(),
            action,
            details,
        };
        let mut entries = self.entries.lock().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries in append order, optionally filtered by plugin id.
    pub async fn query(&self, plugin_id: Option<&str>) -> Vec<AuditEntry> {
        let entries = self.entries.lock().await;
        match plugin_id {
            Some(id) => entries
                .iter()
                .filter(|entry| entry.plugin_id == id)
                .cloned()
                .collect(),
            None => entries.iter().cloned().collect(),
        }
    }

    /// Number of retained entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no entry has been recorded yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
