//! Pod mutation decision engine
//!
//! Handles AdmissionReview requests for pods: classifies each review by
//! resource kind and operation, applies the frozen-node exclusion, volume
//! pinning, and constraint rewrite on CREATE, and feeds the frozen-node
//! registry on UPDATE. The response patch is the before/after diff of the
//! pod, so the mutation logic never hand-assembles patch operations.
//!
//! Failure policy: only an unrecognized resource kind is refused. Malformed
//! objects are answered with the parse error; failures in optional
//! enrichment (claim lookup, backup write, diff) degrade to allow-without-
//! patch with the error carried in the response status.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tracing::{debug, error, info, warn};

use crate::constants::UNSCHEDULABLE_NODE_ANNOTATION;
use crate::error::Error;
use crate::freeze::FrozenNodeRegistry;
use crate::{rewrite, volume};

use super::WebhookState;

/// Resource kind named by a review, as far as this webhook is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewKind {
    /// A core/v1 Pod
    Pod,
    /// Anything else; this webhook refuses it
    Other,
}

/// Operation named by a review
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewOp {
    /// Pod creation; the only operation that produces a patch
    Create,
    /// Pod update; feeds the frozen-node registry
    Update,
    /// Delete, connect - passed through untouched
    Other,
}

fn classify(request: &AdmissionRequest<DynamicObject>) -> (ReviewKind, ReviewOp) {
    let kind = if request.kind.kind == "Pod" {
        ReviewKind::Pod
    } else {
        ReviewKind::Other
    };
    let operation = match request.operation {
        Operation::Create => ReviewOp::Create,
        Operation::Update => ReviewOp::Update,
        Operation::Delete | Operation::Connect => ReviewOp::Other,
    };
    (kind, operation)
}

/// Handle mutating admission review for pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = mutate_pod(&state, &request);
    Json(response.into_review())
}

/// Decide one admission review.
///
/// Pure of I/O apart from the registry and the local claim cache; every
/// outcome is terminal for the request, retry is the cluster's business.
pub fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    match classify(request) {
        (ReviewKind::Other, _) => {
            warn!(kind = %request.kind.kind, uid = %request.uid, "refusing review for unsupported kind");
            AdmissionResponse::from(request)
                .deny(format!("unsupported resource kind: {}", request.kind.kind))
        }
        (ReviewKind::Pod, operation) => {
            let pod = match parse_pod(request) {
                Ok(pod) => pod,
                Err(err) => {
                    error!(error = %err, uid = %request.uid, "could not parse pod from review");
                    return AdmissionResponse::from(request).deny(err.to_string());
                }
            };

            if rewrite::should_skip(&pod) {
                debug!(
                    pod = ?pod.metadata.name,
                    namespace = ?pod.metadata.namespace,
                    "pod not eligible for mutation, allowing unchanged"
                );
                return AdmissionResponse::from(request);
            }

            let owner = owner_uid(&pod);
            match operation {
                ReviewOp::Update => {
                    record_rejected_node(&state.registry, &owner, &pod);
                    AdmissionResponse::from(request)
                }
                ReviewOp::Create => mutate_create(state, request, &pod, &owner),
                ReviewOp::Other => {
                    warn!(operation = ?request.operation, uid = %request.uid, "skipping operation");
                    AdmissionResponse::from(request)
                }
            }
        }
    }
}

/// CREATE pipeline: exclusion, volume pinning, rewrite, diff.
fn mutate_create(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
    pod: &Pod,
    owner: &str,
) -> AdmissionResponse {
    let mut clone = pod.clone();

    // Pods that already have a node were placed by someone with better
    // information; only unplaced pods get the exclusion.
    let unplaced = clone
        .spec
        .as_ref()
        .is_some_and(|spec| spec.node_name.is_none());
    if !owner.is_empty() && unplaced {
        let nodes = state.registry.frozen_nodes(owner);
        if !nodes.is_empty() {
            info!(pod = ?pod.metadata.name, owner = %owner, nodes = ?nodes, "excluding frozen nodes");
            rewrite::exclude_nodes(&mut clone, &nodes);
        }
    }

    volume::pin_to_volume_node(&mut clone, state.claims.as_ref());

    if let Err(err) = rewrite::strip_overlay_constraints(&mut clone, &state.ignore_keys) {
        warn!(error = %err, pod = ?pod.metadata.name, "constraint backup failed");
    }

    let patch = match build_patch(pod, &clone) {
        Ok(patch) => patch,
        Err(err) => return allow_degraded(request, &err),
    };
    debug!(uid = %request.uid, ops = patch.0.len(), "built mutation patch");

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(err) => allow_degraded(request, &Error::patch(err.to_string())),
    }
}

/// Diff the original pod against its mutated clone into patch operations.
fn build_patch(before: &Pod, after: &Pod) -> Result<json_patch::Patch, Error> {
    let before = serde_json::to_value(before)?;
    let after = serde_json::to_value(after)?;
    Ok(json_patch::diff(&before, &after))
}

/// Allow the pod without a patch, carrying the failure in the status.
///
/// Losing the mutation is recoverable (the descheduler will bounce a
/// mis-scheduled pod); rejecting the pod is not.
fn allow_degraded(request: &AdmissionRequest<DynamicObject>, err: &Error) -> AdmissionResponse {
    error!(error = %err, uid = %request.uid, "mutation degraded to allow-without-patch");
    let mut response = AdmissionResponse::from(request);
    response.result.message = err.to_string();
    response.result.code = 403;
    response
}

/// Uid of the pod's first owner reference; empty for ownerless pods.
/// Only the first owner is consulted.
fn owner_uid(pod: &Pod) -> String {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|reference| reference.uid.clone())
        .unwrap_or_default()
}

/// On UPDATE, remember the node the scheduler bounced this pod from.
fn record_rejected_node(registry: &FrozenNodeRegistry, owner: &str, pod: &Pod) {
    if owner.is_empty() {
        return;
    }
    let Some(node) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(UNSCHEDULABLE_NODE_ANNOTATION))
    else {
        return;
    };
    if node.is_empty() {
        return;
    }
    info!(owner = %owner, node = %node, "recording rejected node for owner");
    registry.record(owner, node);
}

fn parse_pod(request: &AdmissionRequest<DynamicObject>) -> Result<Pod, Error> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| Error::invalid_review("review contains no object"))?;
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{
        BACKUP_CONSTRAINTS_ANNOTATION, NODE_NAME_FIELD, SELECTED_NODE_ANNOTATION,
        TAINT_NODE_NOT_READY, TAINT_NODE_UNREACHABLE, VIRTUAL_POD_LABEL,
    };
    use crate::rewrite::SchedulingBackup;
    use crate::volume::ClaimLookup;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use serde_json::{json, Value};

    /// Claim cache with no claims in it
    struct NoClaims;

    impl ClaimLookup for NoClaims {
        fn claim(&self, _namespace: &str, _name: &str) -> Option<Arc<PersistentVolumeClaim>> {
            None
        }
    }

    /// Claim cache that answers every lookup with the same selected node
    struct PinnedClaims(&'static str);

    impl ClaimLookup for PinnedClaims {
        fn claim(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
            let claim: PersistentVolumeClaim = serde_json::from_value(json!({
                "metadata": {
                    "name": name,
                    "namespace": namespace,
                    "annotations": { SELECTED_NODE_ANNOTATION: self.0 },
                }
            }))
            .unwrap();
            Some(Arc::new(claim))
        }
    }

    fn test_state(ignore_keys: &[&str]) -> WebhookState {
        WebhookState::new(
            Arc::new(NoClaims),
            ignore_keys.iter().map(|key| key.to_string()).collect(),
        )
    }

    fn review(operation: &str, kind: &str, object: Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": kind},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": operation,
                "userInfo": {},
                "object": object,
            }
        }))
        .expect("fixture review parses");
        review.try_into().expect("fixture review converts")
    }

    fn virtual_pod_json(name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "labels": { VIRTUAL_POD_LABEL: "true" },
            },
            "spec": { "containers": [] }
        })
    }

    fn with_owner(mut pod: Value, uid: &str) -> Value {
        pod["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "name": "web-1",
            "uid": uid,
        }]);
        pod
    }

    /// Apply the response patch to the original object and return the result
    fn apply_patch(response: &AdmissionResponse, original: &Value) -> Value {
        let bytes = response.patch.as_ref().expect("response carries a patch");
        let patch: json_patch::Patch = serde_json::from_slice(bytes).unwrap();
        let mut patched = original.clone();
        json_patch::patch(&mut patched, &patch).expect("patch applies cleanly");
        patched
    }

    fn backup_of(patched: &Value) -> SchedulingBackup {
        let raw = patched["metadata"]["annotations"][BACKUP_CONSTRAINTS_ANNOTATION]
            .as_str()
            .expect("backup annotation present");
        serde_json::from_str(raw).unwrap()
    }

    // =========================================================================
    // Unit tests
    // =========================================================================

    #[test]
    fn non_pod_kinds_are_refused() {
        let state = test_state(&[]);
        let request = review("CREATE", "Deployment", json!({"metadata": {"name": "web"}}));

        let response = mutate_pod(&state, &request);

        assert!(!response.allowed);
        assert!(response.patch.is_none());
        assert!(response.result.message.contains("unsupported resource kind"));
    }

    #[test]
    fn unparseable_objects_are_answered_with_the_error() {
        let state = test_state(&[]);
        let request = review(
            "CREATE",
            "Pod",
            json!({"metadata": {"name": "web"}, "spec": {"containers": "not-a-list"}}),
        );

        let response = mutate_pod(&state, &request);

        assert!(!response.allowed);
        assert!(response.patch.is_none());
        assert!(!response.result.message.is_empty());
    }

    #[test]
    fn kube_system_pods_pass_through() {
        let state = test_state(&[]);
        let mut pod = virtual_pod_json("web-0");
        pod["metadata"]["namespace"] = json!("kube-system");
        let request = review("CREATE", "Pod", pod);

        let response = mutate_pod(&state, &request);

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn pods_without_virtual_marker_pass_through() {
        let state = test_state(&[]);
        let mut pod = virtual_pod_json("web-0");
        pod["metadata"]["labels"] = json!({"app": "web"});
        let request = review("CREATE", "Pod", pod);

        let response = mutate_pod(&state, &request);

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn update_never_produces_a_patch() {
        let state = test_state(&[]);
        let mut pod = virtual_pod_json("web-0");
        pod["spec"]["nodeSelector"] = json!({"zone": "a"});
        let request = review("UPDATE", "Pod", pod);

        let response = mutate_pod(&state, &request);

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn other_operations_pass_through() {
        let state = test_state(&[]);
        let request = review("DELETE", "Pod", virtual_pod_json("web-0"));

        let response = mutate_pod(&state, &request);

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn create_normalizes_tolerations() {
        let state = test_state(&[]);
        let mut pod = virtual_pod_json("web-0");
        pod["spec"]["tolerations"] = json!([
            {"key": "dedicated", "operator": "Equal", "value": "batch", "effect": "NoSchedule"}
        ]);
        let original = pod.clone();
        let request = review("CREATE", "Pod", pod);

        let response = mutate_pod(&state, &request);
        assert!(response.allowed);

        let patched = apply_patch(&response, &original);
        let tolerations = patched["spec"]["tolerations"].as_array().unwrap();
        assert_eq!(tolerations.len(), 3);
        assert_eq!(tolerations[1]["key"], TAINT_NODE_NOT_READY);
        assert_eq!(tolerations[2]["key"], TAINT_NODE_UNREACHABLE);
        assert_eq!(tolerations[2]["operator"], "Exists");
        assert_eq!(tolerations[2]["effect"], "NoExecute");
    }

    #[test]
    fn create_moves_selector_into_backup_annotation() {
        let state = test_state(&["gpu"]);
        let mut pod = virtual_pod_json("web-0");
        pod["spec"]["nodeSelector"] = json!({"zone": "a", "gpu": "true"});
        let original = pod.clone();
        let request = review("CREATE", "Pod", pod);

        let response = mutate_pod(&state, &request);
        let patched = apply_patch(&response, &original);

        assert_eq!(patched["spec"]["nodeSelector"], json!({"gpu": "true"}));
        let backup = backup_of(&patched);
        assert_eq!(backup.node_selector.get("zone").map(String::as_str), Some("a"));
        assert!(!backup.node_selector.contains_key("gpu"));
    }

    #[test]
    fn create_pins_pod_to_volume_node() {
        let state = WebhookState::new(Arc::new(PinnedClaims("node-4")), vec![]);
        let mut pod = virtual_pod_json("db-0");
        pod["spec"]["volumes"] = json!([
            {"name": "data", "persistentVolumeClaim": {"claimName": "data-db-0"}}
        ]);
        let original = pod.clone();
        let request = review("CREATE", "Pod", pod);

        let response = mutate_pod(&state, &request);
        let patched = apply_patch(&response, &original);

        assert_eq!(patched["spec"]["nodeName"], "node-4");
    }

    #[test]
    fn placed_pods_do_not_get_frozen_node_exclusion() {
        let state = test_state(&[]);
        state.registry.record("u1", "node-7");
        let mut pod = with_owner(virtual_pod_json("web-0"), "u1");
        pod["spec"]["nodeName"] = json!("node-2");
        let original = pod.clone();
        let request = review("CREATE", "Pod", pod);

        let response = mutate_pod(&state, &request);
        let patched = apply_patch(&response, &original);

        assert!(patched["spec"]["affinity"].is_null());
    }

    #[test]
    fn response_echoes_request_uid() {
        let state = test_state(&[]);
        let request = review("CREATE", "Pod", virtual_pod_json("web-0"));

        let response = mutate_pod(&state, &request);

        assert_eq!(response.uid, request.uid);
    }

    // =========================================================================
    // Story tests
    // =========================================================================

    /// Story: a rejected node is avoided by the next sibling pod
    ///
    /// The descheduler marks a pod of owner u1 with the rejected node on
    /// UPDATE. The next CREATE for the same owner must carry an exclusion
    /// for that node in its backup payload, where the syncer applies it in
    /// the member cluster.
    #[test]
    fn story_update_feedback_steers_the_next_create() {
        let state = test_state(&["type"]);

        let mut updated = with_owner(virtual_pod_json("web-0"), "u1");
        updated["metadata"]["annotations"] = json!({UNSCHEDULABLE_NODE_ANNOTATION: "node-7"});
        let update = review("UPDATE", "Pod", updated);
        let response = mutate_pod(&state, &update);
        assert!(response.allowed);
        assert_eq!(state.registry.frozen_nodes("u1"), vec!["node-7"]);

        let replacement = with_owner(virtual_pod_json("web-1"), "u1");
        let original = replacement.clone();
        let create = review("CREATE", "Pod", replacement);
        let response = mutate_pod(&state, &create);
        assert!(response.allowed);

        let patched = apply_patch(&response, &original);
        let backup = backup_of(&patched);
        let terms = &backup
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms;
        let fields = terms[0].match_fields.as_ref().unwrap();
        assert_eq!(fields[0].key, NODE_NAME_FIELD);
        assert_eq!(fields[0].operator, "NotIn");
        assert_eq!(fields[0].values.as_ref().unwrap(), &["node-7".to_string()]);
    }

    /// Story: an ownerless pod never consults the registry
    ///
    /// Naked pods have no siblings to learn from; their CREATE goes through
    /// the rewrite but never picks up an exclusion, whatever the registry
    /// holds for other owners.
    #[test]
    fn story_ownerless_pods_skip_the_registry() {
        let state = test_state(&[]);
        state.registry.record("u1", "node-7");

        let pod = virtual_pod_json("solo");
        let original = pod.clone();
        let request = review("CREATE", "Pod", pod);
        let response = mutate_pod(&state, &request);

        let patched = apply_patch(&response, &original);
        assert!(patched["spec"]["affinity"].is_null());
    }

    /// Story: mutation survives a full round trip through the handler
    #[tokio::test]
    async fn story_handler_round_trips_the_review_envelope() {
        let state = Arc::new(test_state(&[]));
        let body: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "round-trip-uid",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {},
                "object": virtual_pod_json("web-0"),
            }
        }))
        .unwrap();

        let Json(reviewed) = mutate_handler(State(state), Json(body)).await;

        let response = reviewed.response.expect("review carries a response");
        assert_eq!(response.uid, "round-trip-uid");
        assert!(response.allowed);
    }

    /// Story: a review with no request at all is answered, not dropped
    #[tokio::test]
    async fn story_empty_review_is_answered_with_invalid() {
        let state = Arc::new(test_state(&[]));
        let body: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
        }))
        .unwrap();

        let Json(reviewed) = mutate_handler(State(state), Json(body)).await;

        let response = reviewed.response.expect("review carries a response");
        assert!(!response.allowed);
    }
}
