//! Frozen-node registry
//!
//! Tracks, per workload owner, the nodes the scheduler has already rejected
//! for that owner's pods. UPDATE requests feed the registry; CREATE requests
//! read it to steer replacement pods away from the same nodes.
//!
//! The registry is the only mutable state shared between in-flight admission
//! requests. Writes are commutative set-adds keyed by owner uid, so a single
//! `RwLock` around the map is sufficient; no cross-owner coordination exists.
//! Entries grow monotonically for the lifetime of the process; expiry, if
//! any, is the concern of whoever restarts the webhook.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Per-owner record of nodes rejected for that owner's pods.
///
/// Constructed once at startup and handed to the webhook state as an
/// `Arc<FrozenNodeRegistry>`; handlers share the one instance.
#[derive(Debug, Default)]
pub struct FrozenNodeRegistry {
    entries: RwLock<HashMap<String, HashSet<String>>>,
}

impl FrozenNodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `node` as unschedulable for `owner`. Adding the same pair
    /// twice is a no-op.
    pub fn record(&self, owner: &str, node: &str) {
        let mut entries = self.entries.write().expect("frozen-node lock poisoned");
        entries
            .entry(owner.to_string())
            .or_default()
            .insert(node.to_string());
    }

    /// Nodes recorded as unschedulable for `owner`, sorted so callers
    /// produce deterministic patches. Unknown owners get an empty list.
    pub fn frozen_nodes(&self, owner: &str) -> Vec<String> {
        let entries = self.entries.read().expect("frozen-node lock poisoned");
        let mut nodes: Vec<String> = entries
            .get(owner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }
}
