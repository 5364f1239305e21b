//! End-to-end lifecycle stories across all access loops
//!
//! Runs bootstrap, the mode reconcilers and the status aggregator against
//! stateful in-memory fakes of the management cluster and a member cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Namespace, Node, NodeCondition, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use fleet_common::crd::{
    find_condition, merge_conditions, AccessMode, FleetCluster, StatusPatch,
    CONDITION_ALL_NODES_READY, CONDITION_DELETION_SCHEDULED, CONDITION_KUBECONFIG_VALID,
    CONDITION_OVERLAY_CONNECTED, CONDITION_READY,
};
use fleet_common::{Error, Result, DELETE_AT_ANNOTATION};

use crate::context::{Context, KubeClient};
use crate::credentials::tests::{credential_secret, SAMPLE_KUBECONFIG};
use crate::credentials::{ClusterCredential, GENERATED_KUBECONFIG_KEY};
use crate::footprint::MANAGER_NAME;
use crate::overlay::tests::machine;
use crate::overlay::{MockOverlayApi, OverlayMachine, OverlayUser, PreAuthKey};
use crate::remote::{IssuedToken, RemoteCluster, RemoteConnector, Route};
use crate::{bootstrap, direct, overlay_controller, status};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn gone(what: &str) -> Error {
    Error::internal_with_context("fake", format!("{what} not found"))
}

/// In-memory management cluster
///
/// Status conditions are upserted by type, like the real status write.
#[derive(Default)]
struct FakeKube {
    clusters: Mutex<BTreeMap<Key, FleetCluster>>,
    secrets: Mutex<BTreeMap<Key, Secret>>,
    next_uid: AtomicU64,
}

impl FakeKube {
    fn with_credential(namespace: &str, name: &str) -> Self {
        let mut secret = credential_secret(SAMPLE_KUBECONFIG);
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        let kube = Self::default();
        kube.secrets
            .lock()
            .unwrap()
            .insert(key(namespace, name), secret);
        kube
    }

    fn cluster(&self) -> Option<FleetCluster> {
        self.clusters
            .lock()
            .unwrap()
            .get(&key("team-a", "edge"))
            .cloned()
    }

    fn secret(&self) -> Secret {
        self.secrets.lock().unwrap()[&key("team-a", "edge")].clone()
    }

    fn annotate(&self, annotation: &str, value: &str) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(cluster) = clusters.get_mut(&key("team-a", "edge")) {
            cluster
                .annotations_mut()
                .insert(annotation.to_string(), value.to_string());
        }
    }

    fn update<T>(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut FleetCluster) -> T,
    ) -> Result<T> {
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters
            .get_mut(&key(namespace, name))
            .ok_or_else(|| gone("FleetCluster"))?;
        Ok(f(cluster))
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<FleetCluster>> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_cluster(&self, cluster: &FleetCluster) -> Result<FleetCluster> {
        let mut stored = cluster.clone();
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
        stored.metadata.uid = Some(format!("uid-{uid}"));
        let namespace = stored.namespace().unwrap_or_default();
        self.clusters
            .lock()
            .unwrap()
            .insert(key(&namespace, &stored.name_any()), stored.clone());
        Ok(stored)
    }

    async fn patch_access_mode(
        &self,
        namespace: &str,
        name: &str,
        mode: AccessMode,
    ) -> Result<FleetCluster> {
        self.update(namespace, name, |c| {
            c.spec.access_mode = Some(mode);
            c.clone()
        })
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &StatusPatch,
    ) -> Result<()> {
        self.update(namespace, name, |c| {
            let status = c.status.get_or_insert_with(Default::default);
            if let Some(conditions) = &patch.conditions {
                status.conditions = merge_conditions(&status.conditions, conditions);
            }
            if let Some(nodes) = &patch.node_status {
                for (node, entry) in nodes {
                    match entry {
                        Some(entry) => {
                            status.node_status.insert(node.clone(), entry.clone());
                        }
                        None => {
                            status.node_status.remove(node);
                        }
                    }
                }
            }
            if let Some(machine) = &patch.overlay_machine {
                status.overlay_machine = Some(machine.clone());
            }
            if let Some(expiry) = patch.bearer_token_expiration_timestamp {
                status.bearer_token_expiration_timestamp = Some(expiry);
            }
            if let Some(version) = &patch.kubernetes_version {
                status.kubernetes_version = Some(version.clone());
            }
        })
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        self.update(namespace, name, |c| {
            let finalizers = c.finalizers_mut();
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        })
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let mut clusters = self.clusters.lock().unwrap();
        let k = key(namespace, name);
        let Some(cluster) = clusters.get_mut(&k) else {
            return Ok(());
        };
        cluster.finalizers_mut().retain(|f| f != finalizer);
        if cluster.is_terminating() && cluster.finalizers().is_empty() {
            clusters.remove(&k);
        }
        Ok(())
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        let mut clusters = self.clusters.lock().unwrap();
        let k = key(namespace, name);
        let Some(cluster) = clusters.get_mut(&k) else {
            return Ok(());
        };
        if cluster.finalizers().is_empty() {
            clusters.remove(&k);
        } else if cluster.metadata.deletion_timestamp.is_none() {
            cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        field: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        let mut secrets = self.secrets.lock().unwrap();
        let secret = secrets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| gone("Secret"))?;
        secret
            .data
            .get_or_insert_with(Default::default)
            .insert(field.to_string(), ByteString(value));
        Ok(())
    }

    async fn add_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<()> {
        let mut secrets = self.secrets.lock().unwrap();
        let secret = secrets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| gone("Secret"))?;
        let owners = secret.metadata.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RemoteState {
    namespaces: BTreeMap<String, Namespace>,
    accounts: BTreeMap<Key, ServiceAccount>,
    bindings: BTreeMap<String, ClusterRoleBinding>,
    secrets: BTreeMap<Key, Secret>,
    nodes: Vec<Node>,
    tokens_issued: usize,
}

/// In-memory member cluster
///
/// A deleted namespace lingers in `Terminating` for one read before it is gone.
#[derive(Default)]
struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    fn with_nodes(nodes: Vec<Node>) -> Self {
        let remote = Self::default();
        remote.state.lock().unwrap().nodes = nodes;
        remote
    }

    fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains_key(name)
    }

    fn footprint_size(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.namespaces.len() + state.accounts.len() + state.bindings.len()
    }
}

#[async_trait]
impl RemoteCluster for FakeRemote {
    async fn server_version(&self) -> Result<String> {
        Ok("v1.30.2".to_string())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let mut state = self.state.lock().unwrap();
        let terminating = state
            .namespaces
            .get(name)
            .is_some_and(|ns| ns.metadata.deletion_timestamp.is_some());
        if terminating {
            return Ok(state.namespaces.remove(name));
        }
        Ok(state.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(namespace.name_any(), namespace.clone());
        Ok(())
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ns = state.namespaces.get_mut(name).ok_or_else(|| gone("Namespace"))?;
        ns.labels_mut().extend(labels.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(ns) = state.namespaces.get_mut(name) {
            ns.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        state.accounts.retain(|(namespace, _), _| namespace != name);
        state.secrets.retain(|(namespace, _), _| namespace != name);
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<()> {
        let namespace = account.namespace().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .accounts
            .insert(key(&namespace, &account.name_any()), account.clone());
        Ok(())
    }

    async fn patch_service_account_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get_mut(&key(namespace, name))
            .ok_or_else(|| gone("ServiceAccount"))?;
        account.labels_mut().extend(labels.clone());
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        Ok(self.state.lock().unwrap().bindings.get(name).cloned())
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .bindings
            .insert(binding.name_any(), binding.clone());
        Ok(())
    }

    async fn patch_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        self.create_cluster_role_binding(binding).await
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().bindings.remove(name);
        Ok(())
    }

    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<IssuedToken> {
        let mut state = self.state.lock().unwrap();
        if !state.accounts.contains_key(&key(namespace, service_account)) {
            return Err(Error::remote_for("edge", "service account not found"));
        }
        state.tokens_issued += 1;
        Ok(IssuedToken {
            token: format!("token-{}", state.tokens_issued),
            expires_at: Utc::now() + chrono::Duration::seconds(expiration_seconds),
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(key(&namespace, &secret.name_any()), secret.clone());
        Ok(())
    }
}

/// Connector handing out the fake member cluster
struct FakeConnector {
    remote: Arc<FakeRemote>,
    direct_reachable: bool,
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        credential: &ClusterCredential,
        route: &Route,
    ) -> Result<Arc<dyn RemoteCluster>> {
        if *route == Route::Direct && !self.direct_reachable {
            return Err(Error::remote_for(
                credential.cluster(),
                "dial tcp edge.example.com:6443: i/o timeout",
            ));
        }
        let remote: Arc<dyn RemoteCluster> = self.remote.clone();
        Ok(remote)
    }
}

fn node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(k8s_openapi::api::core::v1::NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

struct World {
    kube: Arc<FakeKube>,
    remote: Arc<FakeRemote>,
    ctx: Arc<Context>,
}

impl World {
    fn new(direct_reachable: bool, nodes: Vec<Node>) -> Self {
        Self::build(direct_reachable, nodes, None)
    }

    fn build(direct_reachable: bool, nodes: Vec<Node>, overlay: Option<MockOverlayApi>) -> Self {
        let kube = Arc::new(FakeKube::with_credential("team-a", "edge"));
        let remote = Arc::new(FakeRemote::with_nodes(nodes));
        let connector = FakeConnector {
            remote: remote.clone(),
            direct_reachable,
        };
        let mut ctx = Context::for_testing(kube.clone(), Arc::new(connector));
        if let Some(overlay) = overlay {
            ctx = ctx.with_overlay(Arc::new(overlay));
        }
        Self {
            kube,
            remote,
            ctx: Arc::new(ctx),
        }
    }

    async fn bootstrap(&self) {
        bootstrap::reconcile(Arc::new(self.kube.secret()), self.ctx.clone())
            .await
            .unwrap();
    }

    fn cluster(&self) -> Arc<FleetCluster> {
        Arc::new(self.kube.cluster().unwrap())
    }
}

/// Story: a reachable cluster is onboarded, provisioned and reported Ready
#[tokio::test]
async fn story_reachable_cluster_is_onboarded_directly() {
    let world = World::new(true, vec![node("a", true), node("b", true)]);

    world.bootstrap().await;
    let cluster = world.cluster();
    assert_eq!(cluster.access_mode(), Some(AccessMode::Direct));
    assert!(world.kube.secret().owner_references()[0].uid == cluster.uid().unwrap());

    direct::reconcile(cluster, world.ctx.clone()).await.unwrap();
    assert!(world.remote.has_namespace("team-a"));
    assert_eq!(world.remote.footprint_size(), 3);
    let generated = world.kube.secret().data.unwrap()[GENERATED_KUBECONFIG_KEY].clone();
    assert!(String::from_utf8_lossy(&generated.0).contains("token-1"));

    status::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();
    let cluster = world.cluster();
    assert!(cluster.is_ready());
    assert!(cluster.has_cleanup_finalizer());
    let status = cluster.status.as_ref().unwrap();
    assert_eq!(status.kubernetes_version.as_deref(), Some("v1.30.2"));
    assert!(status.bearer_token_expiration_timestamp.is_some());
    assert_eq!(status.node_status.len(), 2);

    // Second pass: nothing to rotate, nothing to create
    direct::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();
    assert_eq!(world.remote.state.lock().unwrap().tokens_issued, 1);
}

fn overlay_with_machines(machines: Vec<OverlayMachine>) -> MockOverlayApi {
    let mut overlay = MockOverlayApi::new();
    overlay.expect_get_user().returning(|name| {
        Ok(Some(OverlayUser {
            id: "3".to_string(),
            name: name.to_string(),
        }))
    });
    overlay.expect_list_pre_auth_keys().returning(|_| Ok(vec![]));
    overlay.expect_create_pre_auth_key().returning(|req| {
        Ok(PreAuthKey {
            id: "1".to_string(),
            key: "hskey-1".to_string(),
            reusable: req.reusable,
            ephemeral: req.ephemeral,
            used: false,
            expiration: Some(req.expiration),
        })
    });
    overlay
        .expect_list_machines()
        .returning(move |_| Ok(machines.clone()));
    overlay
}

/// Story: an unreachable cluster goes Overlay and waits for its machine
#[tokio::test]
async fn story_unreachable_cluster_waits_for_overlay() {
    let overlay = overlay_with_machines(vec![]);
    let world = World::build(false, vec![node("a", true)], Some(overlay));

    world.bootstrap().await;
    let cluster = world.cluster();
    assert_eq!(cluster.access_mode(), Some(AccessMode::Overlay));

    overlay_controller::reconcile(cluster, world.ctx.clone())
        .await
        .unwrap();
    status::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();

    let cluster = world.cluster();
    let ready = cluster.condition(CONDITION_READY).unwrap();
    assert!(!ready.is_true());
    assert!(ready.message.contains("overlay network not yet connected"));
    assert_eq!(world.remote.footprint_size(), 0);
    assert!(world.kube.secret().data.unwrap().contains_key("overlay-authkey"));
}

/// Story: an elapsed deletion schedule removes the footprint before the cluster goes
#[tokio::test]
async fn story_scheduled_deletion_tears_down_in_order() {
    let world = World::new(true, vec![node("a", true)]);
    world.bootstrap().await;
    direct::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();
    assert!(world.remote.has_namespace("team-a"));

    world.kube.annotate(DELETE_AT_ANNOTATION, "2020-01-01T00:00:00Z");
    direct::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();
    assert!(world.cluster().is_terminating());

    for _ in 0..5 {
        let Some(cluster) = world.kube.cluster() else {
            break;
        };
        direct::reconcile(Arc::new(cluster), world.ctx.clone())
            .await
            .unwrap();
        if world.kube.cluster().is_none() {
            assert!(!world.remote.has_namespace("team-a"));
        }
    }
    assert!(world.kube.cluster().is_none());
    assert_eq!(world.remote.footprint_size(), 0);
    assert!(world
        .remote
        .state
        .lock()
        .unwrap()
        .bindings
        .get(MANAGER_NAME)
        .is_none());
}

/// Story: one node down is named while the cluster stays Ready
#[tokio::test]
async fn story_node_outage_is_reported() {
    let world = World::new(true, vec![node("A", false), node("B", true)]);
    world.bootstrap().await;
    direct::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();
    status::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();

    let cluster = world.cluster();
    let conditions = cluster.conditions();
    let nodes = find_condition(&conditions, CONDITION_ALL_NODES_READY).unwrap();
    assert!(!nodes.is_true());
    assert_eq!(nodes.message, "A not ready");
    assert!(cluster.is_ready());
    assert!(!cluster.node_status()["A"].ready);

    world.remote.state.lock().unwrap().nodes = vec![node("A", true), node("B", true)];
    status::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();

    let cluster = world.cluster();
    let nodes = cluster.condition(CONDITION_ALL_NODES_READY).unwrap();
    assert!(nodes.is_true());
    assert_eq!(nodes.message, "");
    assert!(cluster.node_status()["A"].ready);
}

/// Story: an overlay pass started before the health report does not erase it
#[tokio::test]
async fn story_overlay_pass_keeps_health_conditions() {
    let overlay = overlay_with_machines(vec![machine("7", true, &["100.64.0.7"])]);
    let world = World::build(false, vec![node("a", true)], Some(overlay));
    world.bootstrap().await;
    let before_health = world.cluster();
    assert!(!before_health.is_ready());

    status::reconcile(world.cluster(), world.ctx.clone())
        .await
        .unwrap();
    assert!(world.cluster().is_ready());

    overlay_controller::reconcile(before_health, world.ctx.clone())
        .await
        .unwrap();

    let cluster = world.cluster();
    for type_ in [
        CONDITION_READY,
        CONDITION_KUBECONFIG_VALID,
        CONDITION_ALL_NODES_READY,
        CONDITION_DELETION_SCHEDULED,
        CONDITION_OVERLAY_CONNECTED,
    ] {
        assert!(cluster.condition(type_).is_some(), "{type_} missing");
    }
    assert!(cluster.is_ready());
    assert!(cluster.condition(CONDITION_OVERLAY_CONNECTED).unwrap().is_true());
    assert_eq!(world.remote.footprint_size(), 3);
}
