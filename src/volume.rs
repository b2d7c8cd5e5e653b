//! Volume-affinity resolver
//!
//! A pod whose claim is already bound to a volume on a specific node has no
//! placement freedom left: it must run where its data lives. When any of the
//! pod's persistent-volume-claims carries the selected-node annotation, the
//! pod is pinned to that node directly and every other placement hint becomes
//! irrelevant.
//!
//! Claims are resolved through the [`ClaimLookup`] seam. The production
//! implementation reads a watch-fed local store, so resolution is a bounded
//! in-memory lookup; a miss (claim not found, no annotations) means "no
//! constraint", never an error.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::{debug, info};

use crate::constants::SELECTED_NODE_ANNOTATION;

/// Read access to persistent-volume-claims by namespace and name
pub trait ClaimLookup: Send + Sync {
    /// Fetch a claim, or `None` when it is unknown to the local cache
    fn claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>>;
}

/// [`ClaimLookup`] backed by a reflector store kept current by a background
/// watch; reads never leave the process.
pub struct ClaimStore {
    store: Store<PersistentVolumeClaim>,
}

impl ClaimStore {
    /// Wrap a reflector store; the caller owns driving the watch stream that
    /// feeds it.
    pub fn new(store: Store<PersistentVolumeClaim>) -> Self {
        Self { store }
    }
}

impl ClaimLookup for ClaimStore {
    fn claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }
}

/// Pin the pod to the node its volume landed on, if any claim says so.
///
/// Scans the pod's volumes in declaration order; the first claim that
/// resolves and carries the selected-node annotation wins and ends the scan.
/// Claims that do not resolve, or resolve without the annotation, constrain
/// nothing and the scan continues.
pub fn pin_to_volume_node(pod: &mut Pod, claims: &dyn ClaimLookup) {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    let Some(volumes) = spec.volumes.as_ref() else {
        return;
    };

    for volume in volumes {
        let Some(source) = volume.persistent_volume_claim.as_ref() else {
            continue;
        };
        match selected_node(claims, &namespace, &source.claim_name) {
            Some(node) => {
                info!(node = %node, claim = %source.claim_name, "pinning pod to volume node");
                spec.node_name = Some(node);
                return;
            }
            None => {
                debug!(claim = %source.claim_name, "claim carries no selected node");
            }
        }
    }
}

fn selected_node(claims: &dyn ClaimLookup, namespace: &str, name: &str) -> Option<String> {
    claims
        .claim(namespace, name)?
        .metadata
        .annotations
        .as_ref()?
        .get(SELECTED_NODE_ANNOTATION)
        .cloned()
}
