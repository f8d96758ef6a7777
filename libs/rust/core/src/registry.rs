//! Membership registry of connected node agents.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Registration is always accepted; capacity is never a rejection reason.
/// A node that disconnects is removed for the remainder of the current
/// round only — the next hello re-creates its entry transparently.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<HashMap<String, NodeRegistration>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str) {
        let mut inner = self.inner.write();
        let now = Utc::now();
        match inner.get_mut(node_id) {
            Some(existing) => existing.last_seen = now,
            None => {
                info!(node_id, "node registered");
                inner.insert(
                    node_id.to_string(),
                    NodeRegistration {
                        node_id: node_id.to_string(),
                        last_seen: now,
                    },
                );
            }
        }
    }

    pub fn mark_seen(&self, node_id: &str) {
        if let Some(reg) = self.inner.write().get_mut(node_id) {
            reg.last_seen = Utc::now();
        }
    }

    pub fn remove(&self, node_id: &str) {
        if self.inner.write().remove(node_id).is_some() {
            info!(node_id, "node removed from registry");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Drop nodes whose last hello is older than `stale_after`.
    pub fn sweep(&self, stale_after: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .values()
            .filter(|r| r.last_seen < cutoff)
            .map(|r| r.node_id.clone())
            .collect();
        for id in &stale {
            inner.remove(id);
            debug!(node_id = %id, "stale node swept");
        }
        stale
    }
}
