//! Direct-Access Reconciler
//!
//! Manages clusters whose API server the engine can reach over the network
//! address in the user's kubeconfig. An active pass runs the scheduled
//! deletion check, then finalizer, credential, footprint, token and version
//! refresh, aborting on the first failure. A terminating cluster has its
//! remote footprint torn down before the finalizer is released.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use fleet_common::crd::{AccessMode, FleetCluster, StatusPatch};
use fleet_common::{Error, Result, CLEANUP_FINALIZER};

use crate::context::Context;
use crate::credentials::ClusterCredential;
use crate::footprint::{ensure_footprint, teardown_footprint, TeardownProgress};
use crate::outcome::Outcome;
use crate::remote::{RemoteCluster, Route};
use crate::token::{reconcile_token, TokenOutcome};

/// Reconcile a FleetCluster in Direct mode
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<FleetCluster>, ctx: Arc<Context>) -> Result<Action> {
    if cluster.access_mode() != Some(AccessMode::Direct) {
        return Ok(Action::await_change());
    }
    if cluster.is_terminating() && !cluster.has_cleanup_finalizer() {
        return Ok(Action::await_change());
    }

    let started = Instant::now();
    let result = if cluster.is_terminating() {
        cleanup(&cluster, &ctx).await
    } else {
        apply(&cluster, &ctx, Utc::now()).await
    };
    let outcome = result.unwrap_or_else(|e| {
        warn!(error = %e, "direct access pass failed");
        Outcome::from_error(e, ctx.config.error_requeue_interval)
    });

    ctx.metrics
        .record_reconcile("direct", outcome.label(), started.elapsed());
    outcome.into_action(ctx.config.requeue_interval)
}

async fn apply(cluster: &FleetCluster, ctx: &Context, now: DateTime<Utc>) -> Result<Outcome> {
    let (namespace, name) = cluster_key(cluster)?;

    if delete_if_scheduled(ctx, cluster, now).await? {
        return Ok(Outcome::Done);
    }
    ensure_finalizer(ctx, cluster).await?;

    let credential = ClusterCredential::load(ctx.kube.as_ref(), &namespace, &name).await?;
    let route = Route::Direct;
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
        ctx.metrics.record_token_issued("direct");
    }

    refresh_version(ctx, cluster, remote.as_ref()).await?;
    Ok(Outcome::Done)
}

async fn cleanup(cluster: &FleetCluster, ctx: &Context) -> Result<Outcome> {
    let (namespace, name) = cluster_key(cluster)?;

    match ClusterCredential::load(ctx.kube.as_ref(), &namespace, &name).await {
        Ok(credential) => {
            let remote = ctx.connector.connect(&credential, &Route::Direct).await?;
            if teardown_footprint(remote.as_ref(), &namespace).await? == TeardownProgress::Pending
            {
                debug!("remote footprint teardown in progress");
                return Ok(Outcome::RetryAfter(ctx.config.deletion_poll_interval));
            }
        }
        Err(e @ Error::Credential { .. }) => {
            warn!(error = %e, "no usable credential, leaving remote footprint in place");
        }
        Err(e) => return Err(e),
    }

    ctx.kube
        .remove_finalizer(&namespace, &name, CLEANUP_FINALIZER)
        .await?;
    info!("released cleanup finalizer");
    Ok(Outcome::Done)
}

/// Namespace and name of a cluster
pub(crate) fn cluster_key(cluster: &FleetCluster) -> Result<(String, String)> {
    let namespace = cluster.namespace().ok_or_else(|| {
        Error::internal_with_context("cluster_key", "FleetCluster has no namespace")
    })?;
    Ok((namespace, cluster.name_any()))
}

/// Issue deletion once the scheduled instant has passed
///
/// Returns `true` when deletion was requested, in which case the pass must
/// not provision anything.
pub(crate) async fn delete_if_scheduled(
    ctx: &Context,
    cluster: &FleetCluster,
    now: DateTime<Utc>,
) -> Result<bool> {
    if cluster.is_terminating() || !cluster.deletion_schedule().is_elapsed(now) {
        return Ok(false);
    }
    let (namespace, name) = cluster_key(cluster)?;
    info!("deletion schedule elapsed, deleting cluster");
    ctx.kube.delete_cluster(&namespace, &name).await?;
    Ok(true)
}

/// Add the cleanup finalizer if it is missing
pub(crate) async fn ensure_finalizer(ctx: &Context, cluster: &FleetCluster) -> Result<()> {
    if cluster.has_cleanup_finalizer() {
        return Ok(());
    }
    let (namespace, name) = cluster_key(cluster)?;
    ctx.kube
        .add_finalizer(&namespace, &name, CLEANUP_FINALIZER)
        .await
}

/// Record the remote server version when it changed
pub(crate) async fn refresh_version(
    ctx: &Context,
    cluster: &FleetCluster,
    remote: &dyn RemoteCluster,
) -> Result<String> {
    let version = remote.server_version().await?;
    let known = cluster
        .status
        .as_ref()
        .and_then(|s| s.kubernetes_version.as_deref());
    if known != Some(version.as_str()) {
        let (namespace, name) = cluster_key(cluster)?;
        ctx.kube
            .patch_status(
                &namespace,
                &name,
                &StatusPatch::default().kubernetes_version(&version),
            )
            .await?;
    }
    Ok(version)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::MockKubeClient;
    use crate::credentials::tests::{credential_secret, SAMPLE_KUBECONFIG};
    use crate::credentials::GENERATED_KUBECONFIG_KEY;
    use crate::footprint::{desired_binding, MANAGER_NAME};
    use crate::remote::{IssuedToken, MockRemoteCluster, MockRemoteConnector};
    use fleet_common::crd::{FleetClusterSpec, FleetClusterStatus};
    use fleet_common::DELETE_AT_ANNOTATION;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) fn cluster(mode: AccessMode) -> FleetCluster {
        let mut cluster = FleetCluster::new(
            "edge",
            FleetClusterSpec {
                access_mode: Some(mode),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("team-a".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());
        cluster
    }

    pub(crate) fn finalized(mode: AccessMode) -> FleetCluster {
        let mut cluster = cluster(mode);
        cluster.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        cluster
    }

    pub(crate) fn terminating(mode: AccessMode) -> FleetCluster {
        let mut cluster = finalized(mode);
        cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cluster
    }

    pub(crate) fn kube_with_credential() -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .with(eq("team-a"), eq("edge"))
            .returning(|_, _| Ok(Some(credential_secret(SAMPLE_KUBECONFIG))));
        kube
    }

    /// Remote cluster with no footprint yet that issues tokens and reports a version
    pub(crate) fn fresh_remote() -> MockRemoteCluster {
        let mut remote = MockRemoteCluster::new();
        remote.expect_get_namespace().returning(|_| Ok(None));
        remote
            .expect_create_namespace()
            .times(1)
            .returning(|_| Ok(()));
        remote
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        remote
            .expect_create_service_account()
            .times(1)
            .returning(|_| Ok(()));
        remote
            .expect_get_cluster_role_binding()
            .returning(|_| Ok(None));
        remote
            .expect_create_cluster_role_binding()
            .withf(|b| *b == desired_binding("team-a"))
            .times(1)
            .returning(|_| Ok(()));
        remote
            .expect_request_token()
            .with(eq("team-a"), eq(MANAGER_NAME), eq(48 * 3600i64))
            .times(1)
            .returning(|_, _, seconds| {
                Ok(IssuedToken {
                    token: "issued-token".to_string(),
                    expires_at: Utc::now() + chrono::Duration::seconds(seconds),
                })
            });
        remote
            .expect_server_version()
            .returning(|| Ok("v1.30.2".to_string()));
        remote
    }

    pub(crate) fn connector_to(
        route: Route,
        remote: impl Fn() -> MockRemoteCluster + Send + Sync + 'static,
    ) -> MockRemoteConnector {
        let mut connector = MockRemoteConnector::new();
        connector
            .expect_connect()
            .withf(move |_, r| *r == route)
            .returning(move |_, _| Ok(Arc::new(remote()) as Arc<dyn RemoteCluster>));
        connector
    }

    fn ctx(kube: MockKubeClient, connector: MockRemoteConnector) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(kube), Arc::new(connector)))
    }

    #[tokio::test]
    async fn overlay_clusters_are_ignored() {
        let ctx = ctx(MockKubeClient::new(), MockRemoteConnector::new());
        let action = reconcile(Arc::new(finalized(AccessMode::Overlay)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a freshly classified Direct cluster gets a footprint, a token and a version
    #[tokio::test]
    async fn story_direct_cluster_reaches_steady_state() {
        let mut kube = kube_with_credential();
        kube.expect_add_finalizer()
            .with(eq("team-a"), eq("edge"), eq(CLEANUP_FINALIZER))
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_secret_data()
            .withf(|_, _, key, value| {
                key == GENERATED_KUBECONFIG_KEY
                    && String::from_utf8_lossy(value).contains("https://edge.example.com:6443")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        kube.expect_patch_status()
            .withf(|_, _, patch| patch.bearer_token_expiration_timestamp.is_some())
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_status()
            .withf(|_, _, patch| patch.kubernetes_version.as_deref() == Some("v1.30.2"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = ctx(kube, connector_to(Route::Direct, fresh_remote));
        let action = reconcile(Arc::new(cluster(AccessMode::Direct)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30 * 60)));
    }

    /// Story: a converged cluster only costs reads on the next pass
    #[tokio::test]
    async fn story_converged_cluster_makes_no_writes() {
        let mut kube = kube_with_credential();
        kube.expect_add_finalizer().times(0);
        kube.expect_patch_secret_data().times(0);
        kube.expect_patch_status().times(0);

        let connector = connector_to(Route::Direct, || {
            let mut remote = MockRemoteCluster::new();
            remote.expect_get_namespace().returning(|name| {
                Ok(Some(Namespace {
                    metadata: kube::api::ObjectMeta {
                        name: Some(name.to_string()),
                        labels: Some(fleet_common::kube_utils::managed_labels()),
                        ..Default::default()
                    },
                    ..Default::default()
                }))
            });
            remote.expect_get_service_account().returning(|ns, _| {
                Ok(Some(k8s_openapi::api::core::v1::ServiceAccount {
                    metadata: kube::api::ObjectMeta {
                        name: Some(MANAGER_NAME.to_string()),
                        namespace: Some(ns.to_string()),
                        labels: Some(fleet_common::kube_utils::managed_labels()),
                        ..Default::default()
                    },
                    ..Default::default()
                }))
            });
            remote
                .expect_get_cluster_role_binding()
                .returning(|_| Ok(Some(desired_binding("team-a"))));
            remote.expect_request_token().times(0);
            remote
                .expect_server_version()
                .returning(|| Ok("v1.30.2".to_string()));
            remote
        });

        let mut converged = finalized(AccessMode::Direct);
        converged.status = Some(FleetClusterStatus {
            bearer_token_expiration_timestamp: Some(Utc::now() + chrono::Duration::hours(40)),
            kubernetes_version: Some("v1.30.2".to_string()),
            ..Default::default()
        });

        let action = reconcile(Arc::new(converged), ctx(kube, connector))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30 * 60)));
    }

    /// Story: an elapsed deletion schedule deletes the cluster and provisions nothing
    #[tokio::test]
    async fn story_scheduled_deletion_preempts_provisioning() {
        let mut kube = MockKubeClient::new();
        kube.expect_delete_cluster()
            .with(eq("team-a"), eq("edge"))
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_add_finalizer().times(0);
        kube.expect_get_secret().times(0);
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().times(0);

        let mut scheduled = finalized(AccessMode::Direct);
        scheduled.metadata.annotations = Some(BTreeMap::from([(
            DELETE_AT_ANNOTATION.to_string(),
            "2020-01-01T00:00:00Z".to_string(),
        )]));

        reconcile(Arc::new(scheduled), ctx(kube, connector))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn future_deletion_schedule_is_not_acted_on() {
        let mut kube = MockKubeClient::new();
        kube.expect_delete_cluster().times(0);
        let ctx = ctx(kube, MockRemoteConnector::new());

        let mut scheduled = finalized(AccessMode::Direct);
        scheduled.metadata.annotations = Some(BTreeMap::from([(
            DELETE_AT_ANNOTATION.to_string(),
            (Utc::now() + chrono::Duration::days(1)).to_rfc3339(),
        )]));
        assert!(!delete_if_scheduled(&ctx, &scheduled, Utc::now()).await.unwrap());
    }

    /// Story: the remote cluster is down; nothing is written and the pass retries
    #[tokio::test]
    async fn story_unreachable_cluster_retries_at_fixed_interval() {
        let mut kube = kube_with_credential();
        kube.expect_patch_secret_data().times(0);
        kube.expect_patch_status().times(0);

        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().returning(|_, _| {
            let mut remote = MockRemoteCluster::new();
            remote
                .expect_get_namespace()
                .returning(|_| Err(Error::remote_for("edge", "connection refused")));
            Ok(Arc::new(remote) as Arc<dyn RemoteCluster>)
        });

        let action = reconcile(Arc::new(finalized(AccessMode::Direct)), ctx(kube, connector))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: the finalizer is held until the remote namespace is gone
    #[tokio::test]
    async fn story_teardown_polls_until_namespace_is_gone() {
        let mut kube = kube_with_credential();
        kube.expect_remove_finalizer().times(0);
        let connector = connector_to(Route::Direct, || {
            let mut remote = MockRemoteCluster::new();
            remote
                .expect_delete_cluster_role_binding()
                .with(eq(MANAGER_NAME))
                .returning(|_| Ok(()));
            remote.expect_get_namespace().returning(|name| {
                Ok(Some(Namespace {
                    metadata: kube::api::ObjectMeta {
                        name: Some(name.to_string()),
                        deletion_timestamp: Some(Time(Utc::now())),
                        ..Default::default()
                    },
                    ..Default::default()
                }))
            });
            remote
        });
        let action = reconcile(Arc::new(terminating(AccessMode::Direct)), ctx(kube, connector))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));

        let mut kube = kube_with_credential();
        kube.expect_remove_finalizer()
            .with(eq("team-a"), eq("edge"), eq(CLEANUP_FINALIZER))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let connector = connector_to(Route::Direct, || {
            let mut remote = MockRemoteCluster::new();
            remote
                .expect_delete_cluster_role_binding()
                .returning(|_| Ok(()));
            remote.expect_get_namespace().returning(|_| Ok(None));
            remote
        });
        reconcile(Arc::new(terminating(AccessMode::Direct)), ctx(kube, connector))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deletion_without_credential_releases_finalizer() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().times(0);

        reconcile(Arc::new(terminating(AccessMode::Direct)), ctx(kube, connector))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminating_without_finalizer_is_left_alone() {
        let mut cluster = terminating(AccessMode::Direct);
        cluster.metadata.finalizers = None;
        let action = reconcile(
            Arc::new(cluster),
            ctx(MockKubeClient::new(), MockRemoteConnector::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }
}
