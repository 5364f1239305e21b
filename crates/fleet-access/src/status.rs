//! Status Aggregator
//!
//! Read-only health loop. Every pass re-derives `KubeConfigValid`,
//! `AllNodesReady`, `Ready` and `ClusterDeletionScheduled` from the
//! credential and the remote node list, and writes all four together. It
//! never changes anything in the remote cluster, so it keeps reporting even
//! while provisioning is failing. Terminating and unclassified clusters are
//! not dialed but still get the four conditions.
//!
//! Only the four owned condition types are sent; the status write upserts
//! them onto whatever the other loops last stored.

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use fleet_common::crd::{
    merge_conditions, AccessMode, Condition, ConditionStatus, FleetCluster, NodeStatusMap,
    StatusPatch, CONDITION_ALL_NODES_READY, CONDITION_KUBECONFIG_VALID, CONDITION_READY,
};
use fleet_common::kube_utils::node_status;
use fleet_common::{Error, Result};

use crate::context::Context;
use crate::credentials::ClusterCredential;
use crate::direct::cluster_key;
use crate::overlay::{identity_name, resolve_reachable_address};
use crate::remote::Route;

/// Outcome of checking a cluster's credential against its API server
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialProbe {
    /// The API server answered; nodes keyed by name
    Valid {
        /// Snapshot of every remote node
        nodes: NodeStatusMap,
    },
    /// The credential is unusable or the API server did not answer
    Invalid {
        /// Condition reason
        reason: &'static str,
        /// Error detail
        message: String,
    },
    /// Overlay cluster without an online machine to dial
    OverlayNotConnected {
        /// What is missing
        message: String,
    },
    /// The cluster was not dialed at all
    NotProbed {
        /// Condition reason
        reason: &'static str,
        /// Why the cluster was not dialed
        message: String,
    },
}

/// `KubeConfigValid` reason for an unparsable or missing credential
pub const REASON_INVALID_KUBECONFIG: &str = "InvalidKubeconfig";
/// `KubeConfigValid` reason when the API server could not be reached
pub const REASON_UNREACHABLE: &str = "Unreachable";
/// Reason used while the overlay network has no online machine
pub const REASON_OVERLAY_NOT_CONNECTED: &str = "OverlayNotConnected";
/// Reason while deletion of the cluster is in progress
pub const REASON_TERMINATING: &str = "Terminating";
/// Reason while the access mode has not been resolved
pub const REASON_ACCESS_MODE_UNSET: &str = "AccessModeUnset";

impl CredentialProbe {
    fn from_error(error: Error) -> Self {
        let reason = match error {
            Error::Credential { .. } => REASON_INVALID_KUBECONFIG,
            _ => REASON_UNREACHABLE,
        };
        CredentialProbe::Invalid {
            reason,
            message: error.to_string(),
        }
    }

    /// Probe result for clusters that must not be dialed
    pub fn skipped(cluster: &FleetCluster) -> Option<Self> {
        if cluster.is_terminating() {
            Some(CredentialProbe::NotProbed {
                reason: REASON_TERMINATING,
                message: "cluster is being deleted".to_string(),
            })
        } else if cluster.access_mode().is_none() {
            Some(CredentialProbe::NotProbed {
                reason: REASON_ACCESS_MODE_UNSET,
                message: "access mode not yet resolved".to_string(),
            })
        } else {
            None
        }
    }
}

/// Check the credential and list nodes
pub async fn probe(cluster: &FleetCluster, ctx: &Context) -> CredentialProbe {
    let (namespace, name) = match cluster_key(cluster) {
        Ok(key) => key,
        Err(e) => return CredentialProbe::from_error(e),
    };
    let credential = match ClusterCredential::load(ctx.kube.as_ref(), &namespace, &name).await {
        Ok(credential) => credential,
        Err(e) => return CredentialProbe::from_error(e),
    };

    let route = match cluster.access_mode() {
        Some(AccessMode::Overlay) => {
            let identity = identity_name(&namespace, &name);
            let Some(overlay) = ctx.overlay.as_deref() else {
                return CredentialProbe::OverlayNotConnected {
                    message: "no overlay control API is configured".to_string(),
                };
            };
            match resolve_reachable_address(overlay, &identity).await {
                Ok(Some(address)) => Route::Overlay {
                    address,
                    port: ctx.config.overlay_api_port,
                },
                Ok(None) => {
                    return CredentialProbe::OverlayNotConnected {
                        message: format!("no overlay machine online for identity {identity}"),
                    }
                }
                Err(e) => {
                    warn!(%identity, error = %e, "overlay machine lookup failed");
                    return CredentialProbe::OverlayNotConnected {
                        message: format!("overlay lookup failed: {e}"),
                    };
                }
            }
        }
        _ => Route::Direct,
    };

    let remote = match ctx.connector.connect(&credential, &route).await {
        Ok(remote) => remote,
        Err(e) => return CredentialProbe::from_error(e),
    };
    match remote.list_nodes().await {
        Ok(nodes) => CredentialProbe::Valid {
            nodes: nodes
                .iter()
                .map(|node| (node.name_any(), node_status(node)))
                .collect(),
        },
        Err(e) => CredentialProbe::from_error(e),
    }
}

/// Conditions and node map derived from one probe
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    /// The four health conditions, in a fixed order
    pub conditions: Vec<Condition>,
    /// New node map; `None` keeps the last known snapshot
    pub nodes: Option<NodeStatusMap>,
}

/// Derive the health conditions from a probe
///
/// When the credential is unusable the previous node snapshot is kept and
/// `AllNodesReady` turns `Unknown`.
pub fn aggregate(cluster: &FleetCluster, probe: &CredentialProbe) -> Aggregate {
    let (kubeconfig_valid, all_nodes_ready, ready, nodes) = match probe {
        CredentialProbe::Valid { nodes } => {
            let not_ready: Vec<&str> = nodes
                .iter()
                .filter(|(_, status)| !status.ready)
                .map(|(name, _)| name.as_str())
                .collect();
            let all_nodes_ready = if not_ready.is_empty() {
                Condition::new(
                    CONDITION_ALL_NODES_READY,
                    ConditionStatus::True,
                    "AllNodesReady",
                    "",
                )
            } else {
                Condition::new(
                    CONDITION_ALL_NODES_READY,
                    ConditionStatus::False,
                    "NodesNotReady",
                    format!("{} not ready", not_ready.join(", ")),
                )
            };
            (
                Condition::new(
                    CONDITION_KUBECONFIG_VALID,
                    ConditionStatus::True,
                    "Valid",
                    "kubeconfig is valid",
                ),
                all_nodes_ready,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::True,
                    "Ready",
                    "cluster is reachable",
                ),
                Some(nodes.clone()),
            )
        }
        CredentialProbe::Invalid { reason, message } => (
            Condition::new(
                CONDITION_KUBECONFIG_VALID,
                ConditionStatus::False,
                *reason,
                message.clone(),
            ),
            nodes_unknown(),
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "KubeConfigInvalid",
                format!("kubeconfig invalid: {message}"),
            ),
            None,
        ),
        CredentialProbe::OverlayNotConnected { message } => (
            Condition::new(
                CONDITION_KUBECONFIG_VALID,
                ConditionStatus::False,
                REASON_OVERLAY_NOT_CONNECTED,
                message.clone(),
            ),
            nodes_unknown(),
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_OVERLAY_NOT_CONNECTED,
                format!("overlay network not yet connected: {message}"),
            ),
            None,
        ),
        CredentialProbe::NotProbed { reason, message } => (
            Condition::new(
                CONDITION_KUBECONFIG_VALID,
                ConditionStatus::False,
                *reason,
                message.clone(),
            ),
            Condition::new(
                CONDITION_ALL_NODES_READY,
                ConditionStatus::Unknown,
                *reason,
                "node readiness is not checked",
            ),
            Condition::new(CONDITION_READY, ConditionStatus::False, *reason, message.clone()),
            None,
        ),
    };

    let conditions = vec![
        kubeconfig_valid,
        all_nodes_ready,
        ready,
        cluster.deletion_schedule().condition(),
    ];
    Aggregate { conditions, nodes }
}

fn nodes_unknown() -> Condition {
    Condition::new(
        CONDITION_ALL_NODES_READY,
        ConditionStatus::Unknown,
        "KubeConfigInvalid",
        "node readiness unknown while the cluster cannot be reached",
    )
}

/// Refresh the health conditions of one FleetCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<FleetCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();

    let skipped = CredentialProbe::skipped(&cluster);
    let probe = match &skipped {
        Some(skipped) => {
            debug!("not dialing cluster");
            skipped.clone()
        }
        None => probe(&cluster, &ctx).await,
    };
    let Aggregate { conditions, nodes } = aggregate(&cluster, &probe);
    let result = match write(&cluster, &ctx, conditions, nodes).await {
        Err(e) if e.is_not_found() && cluster.is_terminating() => {
            debug!("cluster already gone");
            Ok(())
        }
        other => other,
    };

    let label = if result.is_ok() { "done" } else { "retry" };
    ctx.metrics
        .record_reconcile("status", label, started.elapsed());
    result?;
    if skipped.is_some() {
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ctx.config.status_interval))
}

async fn write(
    cluster: &FleetCluster,
    ctx: &Context,
    conditions: Vec<Condition>,
    nodes: Option<NodeStatusMap>,
) -> Result<()> {
    let previous_nodes = cluster.node_status();
    let nodes = nodes.filter(|n| *n != previous_nodes);
    let stored = cluster.conditions();
    if nodes.is_none() && merge_conditions(&stored, &conditions) == stored {
        debug!("status unchanged");
        return Ok(());
    }

    let mut patch = StatusPatch::default().conditions(conditions);
    if let Some(nodes) = nodes {
        patch = patch.node_status(&previous_nodes, nodes);
    }
    let (namespace, name) = cluster_key(cluster)?;
    ctx.kube.patch_status(&namespace, &name, &patch).await
}
