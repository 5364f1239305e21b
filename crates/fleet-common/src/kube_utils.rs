//! Shared Kubernetes helpers
//!
//! Small pure functions over k8s-openapi types used by several controllers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::{NodeConditionSnapshot, NodeStatus};
use crate::{MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE};

/// Condition status value meaning "True"
pub const STATUS_TRUE: &str = "True";

/// Check if a condition of the given type has status "True"
pub fn has_condition(conditions: Option<&[NodeCondition]>, condition_type: &str) -> bool {
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == condition_type && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Whether a node's Ready condition is True
pub fn is_node_ready(node: &Node) -> bool {
    has_condition(
        node.status.as_ref().and_then(|s| s.conditions.as_deref()),
        "Ready",
    )
}

/// Snapshot a remote node into the status representation
pub fn node_status(node: &Node) -> NodeStatus {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .map(|c| NodeConditionSnapshot {
                    type_: c.type_.clone(),
                    status: c.status.clone(),
                    reason: c.reason.clone(),
                    message: c.message.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    NodeStatus {
        ready: is_node_ready(node),
        conditions,
    }
}

/// Labels stamped on every object the engine creates remotely
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        MANAGED_BY_LABEL_KEY.to_string(),
        MANAGED_BY_LABEL_VALUE.to_string(),
    )])
}

/// Whether a label map already carries the managed-by label
pub fn is_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str) == Some(MANAGED_BY_LABEL_VALUE)
}

/// Whether an object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Owner reference making `owner` the garbage-collection parent of another object
///
/// Not a controller reference; `blockOwnerDeletion` keeps the owner around
/// until dependents are gone when foreground deletion is used.
pub fn owner_reference<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let uid = owner.meta().uid.clone()?;
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid,
        controller: Some(false),
        block_owner_deletion: Some(true),
    })
}
