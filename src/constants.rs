//! Well-known label, annotation, and taint keys shared with the rest of the
//! overlay.
//!
//! These strings are interop contracts: the scheduler-side syncer reads the
//! backup annotation, the descheduler stamps the rejected-node annotation,
//! and the volume scheduler owns the selected-node annotation. Changing any
//! of them breaks the feedback loop between components.

/// Label marking a pod as targeted at a virtual node. Pods without this
/// marker are never mutated.
pub const VIRTUAL_POD_LABEL: &str = "virtual-pod";

/// Label stamped on pods re-created by the descheduler; such pods already
/// went through mutation once and are left alone.
pub const DESCHEDULER_LABEL: &str = "created-by-descheduler";

/// Annotation holding the serialized original scheduling constraints so the
/// syncer can restore them on the pod it creates in the member cluster.
pub const BACKUP_CONSTRAINTS_ANNOTATION: &str = "clusterSelector";

/// Annotation set on UPDATE by the descheduler naming the node a pod could
/// not be scheduled onto.
pub const UNSCHEDULABLE_NODE_ANNOTATION: &str = "unschedulable-node";

/// Annotation the volume scheduler writes on a claim once it has picked a
/// node for the backing volume.
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Taint applied by the node controller when a node stops reporting ready.
pub const TAINT_NODE_NOT_READY: &str = "node.kubernetes.io/not-ready";

/// Taint applied by the node controller when a node becomes unreachable.
pub const TAINT_NODE_UNREACHABLE: &str = "node.kubernetes.io/unreachable";

/// Field selector key for a node's name, used in match-field requirements.
pub const NODE_NAME_FIELD: &str = "metadata.name";

/// Namespace whose pods are never mutated.
pub const SKIPPED_NAMESPACE: &str = "kube-system";
