//! Remote Footprint Provisioner
//!
//! The engine's presence in a managed cluster is exactly three objects:
//! a namespace named after the FleetCluster's namespace, the `fleet-manager`
//! service account inside it, and a cluster role binding granting that
//! account `cluster-admin`. Everything here is idempotent: a second call with
//! nothing changed makes no writes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use fleet_common::kube_utils::{is_managed, managed_labels};
use fleet_common::Result;

use crate::remote::RemoteCluster;

/// Name of the service account and cluster role binding created remotely
pub const MANAGER_NAME: &str = "fleet-manager";
/// ClusterRole bound to the manager service account
pub const MANAGER_CLUSTER_ROLE: &str = "cluster-admin";

/// Writes performed by one [`ensure_footprint`] call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FootprintReport {
    /// Objects created
    pub created: usize,
    /// Objects patched in place
    pub patched: usize,
    /// Bindings deleted and recreated because their roleRef differed
    pub recreated: usize,
}

impl FootprintReport {
    /// Total number of write calls issued
    pub fn writes(&self) -> usize {
        self.created + self.patched + self.recreated * 2
    }
}

/// Progress of a footprint teardown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownProgress {
    /// Nothing remains
    Done,
    /// The namespace is still terminating
    Pending,
}

fn labels_missing(current: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    managed_labels()
        .into_iter()
        .filter(|(k, v)| current.and_then(|l| l.get(k)) != Some(v))
        .collect()
}

fn desired_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn desired_service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(MANAGER_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The binding the engine expects for a given footprint namespace
pub fn desired_binding(namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(MANAGER_NAME.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: MANAGER_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: MANAGER_NAME.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Make sure namespace, service account and binding exist, in that order
pub async fn ensure_footprint(remote: &dyn RemoteCluster, namespace: &str) -> Result<FootprintReport> {
    let mut report = FootprintReport::default();

    match remote.get_namespace(namespace).await? {
        None => {
            info!(namespace, "creating remote namespace");
            remote.create_namespace(&desired_namespace(namespace)).await?;
            report.created += 1;
        }
        Some(existing) => {
            let missing = labels_missing(existing.metadata.labels.as_ref());
            if !missing.is_empty() {
                remote.patch_namespace_labels(namespace, &missing).await?;
                report.patched += 1;
            }
        }
    }

    match remote.get_service_account(namespace, MANAGER_NAME).await? {
        None => {
            info!(namespace, "creating remote service account");
            remote
                .create_service_account(&desired_service_account(namespace))
                .await?;
            report.created += 1;
        }
        Some(existing) => {
            let missing = labels_missing(existing.metadata.labels.as_ref());
            if !missing.is_empty() {
                remote
                    .patch_service_account_labels(namespace, MANAGER_NAME, &missing)
                    .await?;
                report.patched += 1;
            }
        }
    }

    let desired = desired_binding(namespace);
    match remote.get_cluster_role_binding(MANAGER_NAME).await? {
        None => {
            info!("creating remote cluster role binding");
            remote.create_cluster_role_binding(&desired).await?;
            report.created += 1;
        }
        Some(existing) if existing.role_ref != desired.role_ref => {
            // roleRef is immutable
            info!(
                role = %existing.role_ref.name,
                "recreating remote cluster role binding with a different roleRef"
            );
            remote.delete_cluster_role_binding(MANAGER_NAME).await?;
            remote.create_cluster_role_binding(&desired).await?;
            report.recreated += 1;
        }
        Some(existing) => {
            let labels_ok = existing.metadata.labels.as_ref().is_some_and(is_managed);
            if !labels_ok || existing.subjects != desired.subjects {
                let mut patch = desired.clone();
                let mut labels = existing.metadata.labels.unwrap_or_default();
                labels.extend(managed_labels());
                patch.metadata.labels = Some(labels);
                remote.patch_cluster_role_binding(&patch).await?;
                report.patched += 1;
            }
        }
    }

    debug!(namespace, ?report, "remote footprint ensured");
    Ok(report)
}

/// Remove the footprint
///
/// The binding is cluster-scoped so it is deleted explicitly; the service
/// account goes with its namespace.
pub async fn teardown_footprint(
    remote: &dyn RemoteCluster,
    namespace: &str,
) -> Result<TeardownProgress> {
    remote.delete_cluster_role_binding(MANAGER_NAME).await?;

    match remote.get_namespace(namespace).await? {
        None => Ok(TeardownProgress::Done),
        Some(ns) if ns.metadata.deletion_timestamp.is_some() => {
            debug!(namespace, "remote namespace still terminating");
            Ok(TeardownProgress::Pending)
        }
        Some(_) => {
            info!(namespace, "deleting remote namespace");
            remote.delete_namespace(namespace).await?;
            Ok(TeardownProgress::Pending)
        }
    }
}
