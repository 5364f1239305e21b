//! Access Mode Resolver
//!
//! Watches label-selected Credential Secrets. The first time a credential
//! appears for a cluster whose access mode is unset, the resolver probes the
//! API server directly: success makes the cluster `Direct`, any failure makes
//! it `Overlay`. The mode is sticky; once set, this loop never touches the
//! cluster again.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use fleet_common::crd::{
    AccessMode, Condition, ConditionStatus, FleetCluster, FleetClusterSpec,
    StatusPatch, CONDITION_READY,
};
use fleet_common::kube_utils::owner_reference;
use fleet_common::{Error, Result};

use crate::context::Context;
use crate::credentials::ClusterCredential;
use crate::remote::Route;

/// Ready reason when the direct probe succeeded
pub const REASON_REACHABLE: &str = "Reachable";
/// Ready reason when the cluster has to be reached through the overlay
pub const REASON_OVERLAY_REQUIRED: &str = "OverlayRequired";

/// Reconcile one Credential Secret
#[instrument(skip(secret, ctx), fields(secret = %secret.name_any()))]
pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = resolve(&secret, &ctx).await;
    let label = if result.is_ok() { "done" } else { "retry" };
    ctx.metrics
        .record_reconcile("bootstrap", label, started.elapsed());
    result.map(|()| Action::await_change())
}

async fn resolve(secret: &Secret, ctx: &Context) -> Result<()> {
    let name = secret.name_any();
    let namespace = secret.namespace().ok_or_else(|| {
        Error::internal_with_context("bootstrap", "credential secret has no namespace")
    })?;

    let existing = ctx.kube.get_cluster(&namespace, &name).await?;
    if let Some(cluster) = &existing {
        if cluster.is_terminating() {
            debug!(cluster = %name, "cluster is being deleted, not classifying");
            return Ok(());
        }
        if let Some(mode) = cluster.access_mode() {
            debug!(cluster = %name, %mode, "access mode already set");
            return adopt_secret(ctx, secret, cluster).await;
        }
    }

    let (mode, ready) = match probe(ctx, &name, secret).await {
        Ok(version) => {
            info!(cluster = %name, %version, "API server reachable, using direct access");
            (
                AccessMode::Direct,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_REACHABLE,
                    format!("API server reachable (version {version})"),
                ),
            )
        }
        Err(e) => {
            warn!(cluster = %name, error = %e, "API server not reachable, using overlay access");
            (
                AccessMode::Overlay,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_OVERLAY_REQUIRED,
                    e.to_string(),
                ),
            )
        }
    };

    let cluster = match existing {
        Some(_) => ctx.kube.patch_access_mode(&namespace, &name, mode).await?,
        None => {
            let mut cluster = FleetCluster::new(
                &name,
                FleetClusterSpec {
                    access_mode: Some(mode),
                    ..Default::default()
                },
            );
            cluster.metadata.namespace = Some(namespace.clone());
            info!(cluster = %name, %mode, "creating FleetCluster");
            ctx.kube.create_cluster(&cluster).await?
        }
    };

    ctx.kube
        .patch_status(&namespace, &name, &StatusPatch::default().conditions(vec![ready]))
        .await?;

    adopt_secret(ctx, secret, &cluster).await
}

/// Probe the API server over the kubeconfig's own address
///
/// A credential that cannot even be parsed counts as unreachable; the status
/// aggregator reports the parse error separately.
async fn probe(ctx: &Context, name: &str, secret: &Secret) -> Result<String> {
    let attempt = async {
        let credential = ClusterCredential::from_secret(name, secret)?;
        let remote = ctx.connector.connect(&credential, &Route::Direct).await?;
        remote.server_version().await
    };
    match tokio::time::timeout(ctx.config.probe_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::remote_for(
            name,
            format!(
                "probe timed out after {}s",
                ctx.config.probe_timeout.as_secs()
            ),
        )),
    }
}

/// Make the cluster the garbage-collection owner of its Credential Secret
async fn adopt_secret(ctx: &Context, secret: &Secret, cluster: &FleetCluster) -> Result<()> {
    let owner = owner_reference(cluster).ok_or_else(|| {
        Error::internal_with_context("bootstrap", "FleetCluster has no uid")
    })?;
    if secret.owner_references().iter().any(|o| o.uid == owner.uid) {
        return Ok(());
    }
    let namespace = secret.namespace().unwrap_or_default();
    ctx.kube
        .add_secret_owner(&namespace, &secret.name_any(), owner)
        .await
}
