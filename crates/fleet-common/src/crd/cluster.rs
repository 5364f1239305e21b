//! FleetCluster Custom Resource Definition
//!
//! A FleetCluster is the management record for one member cluster of the
//! fleet. Its spec carries the access mode chosen at bootstrap; its status is
//! the contract other subsystems read (`Ready=True` means the cluster can be
//! operated on).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    find_condition, merge_conditions, AccessMode, Condition, ConditionStatus, NodeStatus, NodeStatusMap,
    OverlayMachineStatus,
};
use crate::kube_utils::has_finalizer;
use crate::{CLEANUP_FINALIZER, DELETE_AT_ANNOTATION};

/// Condition type: the cluster can be operated on
pub const CONDITION_READY: &str = "Ready";
/// Condition type: the stored credential yields a working client
pub const CONDITION_KUBECONFIG_VALID: &str = "KubeConfigValid";
/// Condition type: every remote node reports Ready
pub const CONDITION_ALL_NODES_READY: &str = "AllNodesReady";
/// Condition type: a deletion schedule annotation is present and valid
pub const CONDITION_DELETION_SCHEDULED: &str = "ClusterDeletionScheduled";
/// Condition type: the overlay machine for the cluster is online
pub const CONDITION_OVERLAY_CONNECTED: &str = "OverlayConnected";

/// Specification for a FleetCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.dev",
    version = "v1alpha1",
    kind = "FleetCluster",
    plural = "fleetclusters",
    shortname = "fc",
    status = "FleetClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.accessMode"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetClusterSpec {
    /// How the API server is reached; unset until bootstrap classifies it
    ///
    /// Once set the mode is never changed by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,

    /// Maximum validity of issued bearer tokens, in seconds
    ///
    /// Defaults to the engine's configured token validity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_token_validity: Option<u64>,
}

/// Status for a FleetCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetClusterStatus {
    /// Conditions: Ready, KubeConfigValid, AllNodesReady,
    /// ClusterDeletionScheduled and (overlay only) OverlayConnected
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Readiness of each remote node, keyed by node name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_status: NodeStatusMap,

    /// Overlay machine snapshot (Overlay mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_machine: Option<OverlayMachineStatus>,

    /// Expiry of the bearer token embedded in the generated kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_expiration_timestamp: Option<DateTime<Utc>>,

    /// Version reported by the remote API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

/// Partial status written with a JSON merge patch
///
/// Only the fields a loop owns are set; everything else is left out of the
/// patch body so concurrent loops do not clobber each other. Conditions are
/// the exception: a merge patch replaces arrays wholesale, so the writer
/// upserts them onto the latest stored list (see [`StatusPatch::resolved_against`]).
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    /// Conditions owned by the writing loop, upserted by type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Node entries; a `None` value removes that node from the map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_status: Option<BTreeMap<String, Option<NodeStatus>>>,

    /// Overlay machine snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_machine: Option<OverlayMachineStatus>,

    /// Bearer token expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token_expiration_timestamp: Option<DateTime<Utc>>,

    /// Remote API server version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

impl StatusPatch {
    /// Set the conditions to upsert
    pub fn conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Replace the node map, removing nodes that are no longer reported
    pub fn node_status(mut self, previous: &NodeStatusMap, current: NodeStatusMap) -> Self {
        let mut entries: BTreeMap<String, Option<NodeStatus>> = previous
            .keys()
            .filter(|name| !current.contains_key(*name))
            .map(|name| (name.clone(), None))
            .collect();
        entries.extend(current.into_iter().map(|(name, status)| (name, Some(status))));
        self.node_status = Some(entries);
        self
    }

    /// Set the overlay machine snapshot
    pub fn overlay_machine(mut self, machine: OverlayMachineStatus) -> Self {
        self.overlay_machine = Some(machine);
        self
    }

    /// Set the bearer token expiry
    pub fn bearer_token_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.bearer_token_expiration_timestamp = Some(expires_at);
        self
    }

    /// Set the remote API server version
    pub fn kubernetes_version(mut self, version: impl Into<String>) -> Self {
        self.kubernetes_version = Some(version.into());
        self
    }

    /// Whether the patch would change nothing
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// This patch with its conditions merged onto `current`
    ///
    /// The result carries the full list to send in the merge patch.
    pub fn resolved_against(&self, current: &[Condition]) -> Self {
        let mut resolved = self.clone();
        if let Some(updates) = &self.conditions {
            resolved.conditions = Some(merge_conditions(current, updates));
        }
        resolved
    }
}

/// Parsed deletion schedule annotation
#[derive(Clone, Debug, PartialEq)]
pub enum DeletionSchedule {
    /// No annotation present
    NotScheduled,
    /// Delete once this instant has passed
    At(DateTime<Utc>),
    /// The annotation is present but not an RFC 3339 timestamp
    Invalid(String),
}

impl DeletionSchedule {
    /// Whether the scheduled instant has passed
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::At(at) if *at <= now)
    }

    /// The `ClusterDeletionScheduled` condition describing this schedule
    pub fn condition(&self) -> Condition {
        match self {
            Self::NotScheduled => Condition::new(
                CONDITION_DELETION_SCHEDULED,
                ConditionStatus::False,
                "NotScheduled",
                "",
            ),
            Self::At(at) => Condition::new(
                CONDITION_DELETION_SCHEDULED,
                ConditionStatus::True,
                "Scheduled",
                format!("cluster is scheduled for deletion at {}", at.to_rfc3339()),
            ),
            Self::Invalid(raw) => Condition::new(
                CONDITION_DELETION_SCHEDULED,
                ConditionStatus::False,
                "InvalidSchedule",
                format!("annotation {DELETE_AT_ANNOTATION} is not an RFC 3339 timestamp: {raw}"),
            ),
        }
    }
}

impl FleetCluster {
    /// Access mode, if bootstrap has classified the cluster
    pub fn access_mode(&self) -> Option<AccessMode> {
        self.spec.access_mode
    }

    /// Whether deletion has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the cleanup finalizer is present
    pub fn has_cleanup_finalizer(&self) -> bool {
        has_finalizer(self, CLEANUP_FINALIZER)
    }

    /// Parse the deletion schedule annotation
    pub fn deletion_schedule(&self) -> DeletionSchedule {
        match self.annotations().get(DELETE_AT_ANNOTATION) {
            None => DeletionSchedule::NotScheduled,
            Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(at) => DeletionSchedule::At(at.with_timezone(&Utc)),
                Err(_) => DeletionSchedule::Invalid(raw.clone()),
            },
        }
    }

    /// Conditions from the last observed status
    pub fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }

    /// Look up one condition from the last observed status
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, type_))
    }

    /// Whether the `Ready` condition is True
    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY).is_some_and(Condition::is_true)
    }

    /// Node map from the last observed status
    pub fn node_status(&self) -> NodeStatusMap {
        self.status
            .as_ref()
            .map(|s| s.node_status.clone())
            .unwrap_or_default()
    }

    /// Expiry of the current bearer token, if one has been issued
    pub fn bearer_token_expiration(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.bearer_token_expiration_timestamp)
    }
}
