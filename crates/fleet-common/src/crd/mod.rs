//! Custom Resource Definitions for Fleet
//!
//! The engine owns a single CRD, [`FleetCluster`], plus the shared condition
//! and snapshot types its status is built from.

mod cluster;
mod types;

pub use cluster::{
    DeletionSchedule, FleetCluster, FleetClusterSpec, FleetClusterStatus, StatusPatch,
    CONDITION_ALL_NODES_READY, CONDITION_DELETION_SCHEDULED, CONDITION_KUBECONFIG_VALID,
    CONDITION_OVERLAY_CONNECTED, CONDITION_READY,
};
pub use types::{
    find_condition, merge_conditions, set_condition, AccessMode, Condition, ConditionStatus, NodeConditionSnapshot,
    NodeStatus, NodeStatusMap, OverlayMachineStatus,
};
