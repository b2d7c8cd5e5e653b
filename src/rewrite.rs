//! Scheduling-constraint rewriter
//!
//! Pods bound for a virtual node must not carry scheduling constraints that
//! only mean something in the member cluster: the host scheduler would try to
//! satisfy them against host nodes and fail. The rewriter strips everything
//! except an operator-supplied ignore list from the live node selector and
//! required node affinity, parks the stripped constraints in the
//! [`BACKUP_CONSTRAINTS_ANNOTATION`] for the syncer to restore on the far
//! side, and normalizes tolerations so virtual-node pods always tolerate the
//! not-ready/unreachable taints a virtual node may briefly carry.
//!
//! Everything here is a pure function over the pod; the decision engine in
//! [`crate::webhook::pod`] owns ordering and the before/after diff.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    Toleration,
};
use serde::{Deserialize, Serialize};

use crate::constants::{
    BACKUP_CONSTRAINTS_ANNOTATION, DESCHEDULER_LABEL, NODE_NAME_FIELD, SKIPPED_NAMESPACE,
    TAINT_NODE_NOT_READY, TAINT_NODE_UNREACHABLE, VIRTUAL_POD_LABEL,
};
use crate::Result;

/// Snapshot of the scheduling constraints removed from the live pod.
///
/// Serialized into the backup annotation; the syncer deserializes it and
/// re-applies the constraints to the pod it creates in the member cluster.
/// Field names are part of the wire contract with the syncer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulingBackup {
    /// Node-selector entries stripped from the live pod
    #[serde(
        rename = "nodeSelector",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub node_selector: BTreeMap<String, String>,

    /// Required node-affinity constraints stripped from the live pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// The pod's tolerations as they were before normalization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

/// Whether a pod is out of scope for mutation entirely.
///
/// `kube-system` pods are never touched. The label rules only fire when the
/// pod actually carries a label map: a pod with labels is skipped when the
/// descheduler already re-created it, or when it lacks the virtual-pod
/// marker; a pod with no labels at all falls through to mutation.
pub fn should_skip(pod: &Pod) -> bool {
    if pod.metadata.namespace.as_deref() == Some(SKIPPED_NAMESPACE) {
        return true;
    }
    if let Some(labels) = &pod.metadata.labels {
        if labels.get(DESCHEDULER_LABEL).map(String::as_str) == Some("true") {
            return true;
        }
        if labels.get(VIRTUAL_POD_LABEL).map(String::as_str) != Some("true") {
            return true;
        }
    }
    false
}

/// Whether the strip pass has nothing to work with: no node selector, no
/// affinity, and no toleration list at all.
pub fn skip_strip(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return true;
    };
    spec.node_selector.as_ref().is_none_or(BTreeMap::is_empty)
        && spec.affinity.is_none()
        && spec.tolerations.is_none()
}

/// Merge a `metadata.name NotIn [nodes]` match-field requirement into every
/// required node-affinity term, creating a single term when none exist.
///
/// Terms are disjuncts, so the exclusion has to land in each of them to be
/// binding. Existing requirements are kept; preferred terms and pod
/// (anti-)affinity are untouched.
pub fn exclude_nodes(pod: &mut Pod, nodes: &[String]) {
    if nodes.is_empty() {
        return;
    }
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };

    let requirement = NodeSelectorRequirement {
        key: NODE_NAME_FIELD.to_string(),
        operator: "NotIn".to_string(),
        values: Some(nodes.to_vec()),
    };

    let required = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    if required.node_selector_terms.is_empty() {
        required.node_selector_terms.push(NodeSelectorTerm::default());
    }
    for term in &mut required.node_selector_terms {
        term.match_fields
            .get_or_insert_with(Vec::new)
            .push(requirement.clone());
    }
}

/// Strip overlay-managed constraints from the live pod into the backup
/// annotation and normalize tolerations.
///
/// Keys named in `ignore_keys` survive untouched on the live pod; everything
/// else moves into the backup payload. The annotation is only rewritten when
/// this pass stripped something or no backup exists yet, so running the
/// rewriter again over its own output changes nothing.
pub fn strip_overlay_constraints(pod: &mut Pod, ignore_keys: &[String]) -> Result<()> {
    if skip_strip(pod) {
        return Ok(());
    }
    let ignore: HashSet<&str> = ignore_keys.iter().map(String::as_str).collect();

    let mut backup = SchedulingBackup::default();
    if let Some(spec) = pod.spec.as_mut() {
        if let Some(affinity) = spec.affinity.as_mut() {
            backup.affinity = strip_affinity(affinity, &ignore);
        }
        if let Some(selector) = spec.node_selector.as_mut() {
            backup.node_selector = partition_selector(selector, &ignore);
        }
        // Snapshot before normalization; the syncer restores the caller's
        // own tolerations, not the injected defaults.
        backup.tolerations = spec.tolerations.clone();
    }

    let already_backed_up = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(BACKUP_CONSTRAINTS_ANNOTATION));
    let stripped = !backup.node_selector.is_empty() || backup.affinity.is_some();
    if stripped || !already_backed_up {
        let payload = serde_json::to_string(&backup)?;
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(BACKUP_CONSTRAINTS_ANNOTATION.to_string(), payload);
    }

    if let Some(spec) = pod.spec.as_mut() {
        spec.tolerations = Some(normalize_tolerations(
            spec.tolerations.as_deref().unwrap_or_default(),
        ));
    }
    Ok(())
}

/// Remove every non-ignored key from the live selector, returning the
/// removed entries for the backup payload.
fn partition_selector(
    selector: &mut BTreeMap<String, String>,
    ignore: &HashSet<&str>,
) -> BTreeMap<String, String> {
    let mut stripped = BTreeMap::new();
    selector.retain(|key, value| {
        if ignore.contains(key.as_str()) {
            true
        } else {
            stripped.insert(key.clone(), value.clone());
            false
        }
    });
    stripped
}

/// Filter the required node-affinity term list, returning the stripped
/// constraints reassembled in the same shape.
///
/// Only required-during-scheduling terms are inspected; preferred terms pass
/// through unexamined. A single forward pass builds two fresh lists per
/// term; terms that end up empty are dropped, and if every live term drops
/// the required selector clears entirely. The live affinity struct itself
/// survives, so pod (anti-)affinity is unaffected.
fn strip_affinity(affinity: &mut Affinity, ignore: &HashSet<&str>) -> Option<Affinity> {
    let node_affinity = affinity.node_affinity.as_mut()?;
    let required = node_affinity
        .required_during_scheduling_ignored_during_execution
        .take()?;

    let mut backup_terms = Vec::new();
    let mut live_terms = Vec::new();
    for term in required.node_selector_terms {
        let (stripped_expressions, retained_expressions) =
            partition_requirements(term.match_expressions, ignore);
        let (stripped_fields, retained_fields) = partition_requirements(term.match_fields, ignore);

        if stripped_expressions.is_some() || stripped_fields.is_some() {
            backup_terms.push(NodeSelectorTerm {
                match_expressions: stripped_expressions,
                match_fields: stripped_fields,
            });
        }
        if retained_expressions.is_some() || retained_fields.is_some() {
            live_terms.push(NodeSelectorTerm {
                match_expressions: retained_expressions,
                match_fields: retained_fields,
            });
        }
    }

    if !live_terms.is_empty() {
        node_affinity.required_during_scheduling_ignored_during_execution = Some(NodeSelector {
            node_selector_terms: live_terms,
        });
    }

    if backup_terms.is_empty() {
        return None;
    }
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: backup_terms,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Split one requirement list into (stripped-for-backup, retained-for-live).
fn partition_requirements(
    requirements: Option<Vec<NodeSelectorRequirement>>,
    ignore: &HashSet<&str>,
) -> (
    Option<Vec<NodeSelectorRequirement>>,
    Option<Vec<NodeSelectorRequirement>>,
) {
    let Some(requirements) = requirements else {
        return (None, None);
    };
    let mut stripped = Vec::new();
    let mut retained = Vec::new();
    for requirement in requirements {
        if ignore.contains(requirement.key.as_str()) {
            retained.push(requirement);
        } else {
            stripped.push(requirement);
        }
    }
    (none_if_empty(stripped), none_if_empty(retained))
}

fn none_if_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Rebuild the toleration list so it contains exactly one entry for each of
/// the not-ready/unreachable taints, with the canonical operator and effect.
///
/// Caller tolerations for those keys are replaced by the canonical form even
/// when operator or effect differ; duplicates collapse to one entry. All
/// other tolerations pass through unchanged. Missing entries are appended at
/// the end, not-ready before unreachable.
pub fn normalize_tolerations(existing: &[Toleration]) -> Vec<Toleration> {
    let mut normalized = Vec::with_capacity(existing.len() + 2);
    let mut has_not_ready = false;
    let mut has_unreachable = false;

    for toleration in existing {
        match toleration.key.as_deref() {
            Some(TAINT_NODE_NOT_READY) => {
                if !has_not_ready {
                    normalized.push(desired_toleration(TAINT_NODE_NOT_READY));
                }
                has_not_ready = true;
            }
            Some(TAINT_NODE_UNREACHABLE) => {
                if !has_unreachable {
                    normalized.push(desired_toleration(TAINT_NODE_UNREACHABLE));
                }
                has_unreachable = true;
            }
            _ => normalized.push(toleration.clone()),
        }
    }

    if !has_not_ready {
        normalized.push(desired_toleration(TAINT_NODE_NOT_READY));
    }
    if !has_unreachable {
        normalized.push(desired_toleration(TAINT_NODE_UNREACHABLE));
    }
    normalized
}

/// Canonical toleration injected for the well-known taint keys
fn desired_toleration(key: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoExecute".to_string()),
        ..Default::default()
    }
}
