//! Overlay-Access Reconciler
//!
//! Manages clusters only reachable through the overlay network. A pass
//! ensures the overlay identity and a usable pre-auth key, then waits for a
//! machine to join. Once one is online the engine dials the API server over
//! the machine's overlay address and provisions the footprint and token just
//! like the direct loop does.
//!
//! The `OverlayConnected` condition, the machine snapshot and the Kubernetes
//! version are published at the end of every pass, whichever branch ran and
//! whether or not it failed.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use fleet_common::crd::{
    AccessMode, Condition, ConditionStatus, FleetCluster, StatusPatch,
    CONDITION_OVERLAY_CONNECTED,
};
use fleet_common::kube_utils::managed_labels;
use fleet_common::{Error, Result, CLEANUP_FINALIZER};

use crate::context::Context;
use crate::credentials::{ClusterCredential, OVERLAY_AUTH_KEY_FIELD};
use crate::direct::{cluster_key, delete_if_scheduled, ensure_finalizer};
use crate::footprint::{ensure_footprint, teardown_footprint, TeardownProgress};
use crate::outcome::Outcome;
use crate::overlay::{
    delete_identity, delete_machines, ensure_identity, identity_name, machine_snapshot,
    reconcile_pre_auth_key, resolve_reachable_address, select_reachable, KeyOutcome, OverlayApi,
    OverlayMachine,
};
use crate::remote::Route;
use crate::token::{reconcile_token, TokenOutcome};

/// Secret in the managed namespace the in-cluster overlay client reads its key from
pub const REMOTE_AUTH_SECRET: &str = "fleet-overlay-auth";
/// Field of [`REMOTE_AUTH_SECRET`] holding the pre-auth key
pub const REMOTE_AUTH_KEY: &str = "authkey";

/// `OverlayConnected` reason when a machine is online
pub const REASON_MACHINE_ONLINE: &str = "MachineOnline";
/// `OverlayConnected` reason while no machine is online
pub const REASON_AWAITING_JOIN: &str = "AwaitingJoin";
/// `OverlayConnected` reason when the control API could not be queried
pub const REASON_LOOKUP_FAILED: &str = "LookupFailed";

/// What a pass learned that the status publisher can reuse
#[derive(Debug, Default)]
struct Observed {
    machines: Option<Vec<OverlayMachine>>,
    key_expiration: Option<DateTime<Utc>>,
    version: Option<String>,
}

/// Reconcile a FleetCluster in Overlay mode
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<FleetCluster>, ctx: Arc<Context>) -> Result<Action> {
    if cluster.access_mode() != Some(AccessMode::Overlay) {
        return Ok(Action::await_change());
    }
    if cluster.is_terminating() && !cluster.has_cleanup_finalizer() {
        return Ok(Action::await_change());
    }
    let Some(overlay) = ctx.overlay.clone() else {
        return Err(Error::config(
            "cluster uses overlay access but no overlay control API is configured",
        ));
    };

    let started = Instant::now();
    let mut observed = Observed::default();
    let result = if cluster.is_terminating() {
        cleanup(&cluster, &ctx, overlay.as_ref()).await
    } else {
        apply(&cluster, &ctx, overlay.as_ref(), Utc::now(), &mut observed).await
    };
    let mut outcome = result.unwrap_or_else(|e| {
        warn!(error = %e, "overlay access pass failed");
        Outcome::from_error(e, ctx.config.error_requeue_interval)
    });

    let released = cluster.is_terminating() && matches!(outcome, Outcome::Done);
    if !released {
        if let Err(e) = publish_status(&cluster, &ctx, overlay.as_ref(), observed).await {
            warn!(error = %e, "failed to publish overlay status");
            if matches!(outcome, Outcome::Done) {
                outcome = Outcome::from_error(e, ctx.config.error_requeue_interval);
            }
        }
    }

    ctx.metrics
        .record_reconcile("overlay", outcome.label(), started.elapsed());
    outcome.into_action(ctx.config.requeue_interval)
}

async fn apply(
    cluster: &FleetCluster,
    ctx: &Context,
    overlay: &dyn OverlayApi,
    now: DateTime<Utc>,
    observed: &mut Observed,
) -> Result<Outcome> {
    let (namespace, name) = cluster_key(cluster)?;

    if delete_if_scheduled(ctx, cluster, now).await? {
        return Ok(Outcome::Done);
    }
    ensure_finalizer(ctx, cluster).await?;

    let identity = identity_name(&namespace, &name);
    ensure_identity(overlay, &identity).await?;
    let KeyOutcome { key, created } = reconcile_pre_auth_key(
        overlay,
        &identity,
        now,
        ctx.config.pre_auth_key_validity,
        ctx.config.min_pre_auth_key_validity,
    )
    .await?;
    if created {
        ctx.metrics.record_pre_auth_key_created();
    }
    observed.key_expiration = key.expiration;

    let secret = ctx.kube.get_secret(&namespace, &name).await?.ok_or_else(|| {
        Error::credential_for(&name, format!("credential secret {namespace}/{name} not found"))
    })?;
    store_audit_key(ctx, &secret, &namespace, &name, &key.key).await?;

    let machines = overlay.list_machines(&identity).await?;
    let address = select_reachable(&machines).map(|(_, address)| address);
    observed.machines = Some(machines);
    let Some(address) = address else {
        info!(%identity, "waiting for an overlay machine to join");
        return Ok(Outcome::RetryAfter(ctx.config.join_poll_interval));
    };

    let credential = ClusterCredential::from_secret(&name, &secret)?;
    let route = Route::Overlay {
        address,
        port: ctx.config.overlay_api_port,
    };
    let remote = ctx.connector.connect(&credential, &route).await?;

    let report = ensure_footprint(remote.as_ref(), &namespace).await?;
    if report.writes() > 0 {
        info!(?report, "remote footprint updated");
    }

    let endpoint = route.endpoint(credential.endpoint());
    let settings = ctx.config.token_settings(cluster.spec.max_token_validity);
    let token = reconcile_token(
        remote.as_ref(),
        ctx.kube.as_ref(),
        cluster,
        &endpoint,
        settings,
        now,
    )
    .await?;
    if let TokenOutcome::Rotated { .. } = token {
        ctx.metrics.record_token_issued("overlay");
    }

    remote
        .apply_secret(&remote_auth_secret(&namespace, &key.key))
        .await?;

    observed.version = Some(remote.server_version().await?);
    Ok(Outcome::Done)
}

/// Teardown: footprint, machines, identity, finalizer
///
/// Each step has to report done before the next one starts.
async fn cleanup(
    cluster: &FleetCluster,
    ctx: &Context,
    overlay: &dyn OverlayApi,
) -> Result<Outcome> {
    let (namespace, name) = cluster_key(cluster)?;
    let identity = identity_name(&namespace, &name);
    let poll = Outcome::RetryAfter(ctx.config.deletion_poll_interval);

    match resolve_reachable_address(overlay, &identity).await? {
        Some(address) => match ClusterCredential::load(ctx.kube.as_ref(), &namespace, &name).await
        {
            Ok(credential) => {
                let route = Route::Overlay {
                    address,
                    port: ctx.config.overlay_api_port,
                };
                let remote = ctx.connector.connect(&credential, &route).await?;
                if teardown_footprint(remote.as_ref(), &namespace).await?
                    == TeardownProgress::Pending
                {
                    debug!("remote footprint teardown in progress");
                    return Ok(poll);
                }
            }
            Err(e @ Error::Credential { .. }) => {
                warn!(error = %e, "no usable credential, leaving remote footprint in place");
            }
            Err(e) => return Err(e),
        },
        None => {
            warn!(%identity, "no overlay machine online, leaving remote footprint in place");
        }
    }

    if !delete_machines(overlay, &identity).await? {
        debug!(%identity, "overlay machines still registered");
        return Ok(poll);
    }
    if !delete_identity(overlay, &identity).await? {
        debug!(%identity, "overlay identity still present");
        return Ok(poll);
    }

    ctx.kube
        .remove_finalizer(&namespace, &name, CLEANUP_FINALIZER)
        .await?;
    info!("released cleanup finalizer");
    Ok(Outcome::Done)
}

/// Keep an audit copy of the pre-auth key in the Credential Secret
async fn store_audit_key(
    ctx: &Context,
    secret: &Secret,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<()> {
    let current = secret
        .data
        .as_ref()
        .and_then(|d| d.get(OVERLAY_AUTH_KEY_FIELD));
    if current.is_some_and(|v| v.0 == key.as_bytes()) {
        return Ok(());
    }
    ctx.kube
        .patch_secret_data(namespace, name, OVERLAY_AUTH_KEY_FIELD, key.as_bytes().to_vec())
        .await
}

fn remote_auth_secret(namespace: &str, key: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(REMOTE_AUTH_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        data: Some(
            [(
                REMOTE_AUTH_KEY.to_string(),
                ByteString(key.as_bytes().to_vec()),
            )]
            .into(),
        ),
        ..Default::default()
    }
}

/// `OverlayConnected` condition for the observed machines
fn connected_condition(identity: &str, machines: &[OverlayMachine]) -> Condition {
    match select_reachable(machines) {
        Some((machine, address)) => Condition::new(
            CONDITION_OVERLAY_CONNECTED,
            ConditionStatus::True,
            REASON_MACHINE_ONLINE,
            format!("machine {} online at {address}", machine.name),
        ),
        None => Condition::new(
            CONDITION_OVERLAY_CONNECTED,
            ConditionStatus::False,
            REASON_AWAITING_JOIN,
            format!("no overlay machine online for identity {identity}"),
        ),
    }
}

async fn publish_status(
    cluster: &FleetCluster,
    ctx: &Context,
    overlay: &dyn OverlayApi,
    observed: Observed,
) -> Result<()> {
    let (namespace, name) = cluster_key(cluster)?;
    let identity = identity_name(&namespace, &name);
    let previous = cluster.status.as_ref();

    let machines = match observed.machines {
        Some(machines) => Ok(machines),
        None => overlay.list_machines(&identity).await,
    };

    let mut patch = StatusPatch::default();
    let condition = match machines {
        Ok(machines) => {
            let key_expiration = observed.key_expiration.or_else(|| {
                previous
                    .and_then(|s| s.overlay_machine.as_ref())
                    .and_then(|m| m.pre_auth_key_expiration)
            });
            let snapshot = machine_snapshot(&identity, &machines, key_expiration);
            if previous.and_then(|s| s.overlay_machine.as_ref()) != Some(&snapshot) {
                patch = patch.overlay_machine(snapshot);
            }
            connected_condition(&identity, &machines)
        }
        Err(e) => {
            warn!(%identity, error = %e, "overlay machine lookup failed");
            Condition::new(
                CONDITION_OVERLAY_CONNECTED,
                ConditionStatus::Unknown,
                REASON_LOOKUP_FAILED,
                e.to_string(),
            )
        }
    };

    let unchanged = cluster
        .condition(CONDITION_OVERLAY_CONNECTED)
        .is_some_and(|c| {
            c.status == condition.status
                && c.reason == condition.reason
                && c.message == condition.message
        });
    if !unchanged {
        patch = patch.conditions(vec![condition]);
    }

    if let Some(version) = observed.version {
        if previous.and_then(|s| s.kubernetes_version.as_deref()) != Some(version.as_str()) {
            patch = patch.kubernetes_version(version);
        }
    }

    if patch.is_empty() {
        return Ok(());
    }
    ctx.kube.patch_status(&namespace, &name, &patch).await
}
