//! Shared controller context and the management-cluster API seam
//!
//! Every access loop receives an `Arc<Context>`. All calls against the
//! management cluster go through [`KubeClient`] so reconcilers can be tested
//! with mocks.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::{AccessMode, FleetCluster, StatusPatch};
use fleet_common::{AccessConfig, Metrics, Result, FIELD_MANAGER};

use crate::overlay::OverlayApi;
use crate::remote::{KubeRemoteConnector, RemoteConnector};

/// Attempts at a condition write before a conflict is returned to the caller
const STATUS_CONFLICT_ATTEMPTS: usize = 5;

/// Trait abstracting management-cluster operations for the access loops
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a FleetCluster, `None` if absent
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<FleetCluster>>;

    /// Create a FleetCluster, returning the stored object (with uid)
    async fn create_cluster(&self, cluster: &FleetCluster) -> Result<FleetCluster>;

    /// Set `spec.accessMode`, returning the updated object
    async fn patch_access_mode(
        &self,
        namespace: &str,
        name: &str,
        mode: AccessMode,
    ) -> Result<FleetCluster>;

    /// Merge-patch the status subresource with the fields set in `status`
    ///
    /// Conditions in the patch are upserted by type onto the latest stored
    /// list; conditions of other types are left alone.
    async fn patch_status(&self, namespace: &str, name: &str, status: &StatusPatch)
        -> Result<()>;

    /// Add a finalizer if not already present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer if present
    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<()>;

    /// Request deletion of a FleetCluster
    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a Secret, `None` if absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Set one data field of a Secret
    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Add an owner reference to a Secret unless one with the same uid exists
    async fn add_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, namespace: &str) -> Api<FleetCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<FleetCluster>> {
        match self.clusters(namespace).get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_cluster(&self, cluster: &FleetCluster) -> Result<FleetCluster> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        Ok(self
            .clusters(namespace)
            .create(&PostParams::default(), cluster)
            .await?)
    }

    async fn patch_access_mode(
        &self,
        namespace: &str,
        name: &str,
        mode: AccessMode,
    ) -> Result<FleetCluster> {
        let patch = serde_json::json!({ "spec": { "accessMode": mode } });
        Ok(self
            .clusters(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StatusPatch,
    ) -> Result<()> {
        if status.is_empty() {
            return Ok(());
        }
        let api = self.clusters(namespace);
        let params = PatchParams::apply(FIELD_MANAGER);

        if status.conditions.is_none() {
            let status_patch = serde_json::json!({ "status": status });
            api.patch_status(name, &params, &Patch::Merge(&status_patch))
                .await?;
            return Ok(());
        }

        // Conditions share one array: merge onto the latest copy and let the
        // resourceVersion precondition reject writes based on a stale read
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = api.get_status(name).await?;
            let resolved = status.resolved_against(&current.conditions());
            let status_patch = serde_json::json!({
                "metadata": { "resourceVersion": current.resource_version() },
                "status": resolved,
            });
            match api
                .patch_status(name, &params, &Patch::Merge(&status_patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae))
                    if ae.code == 409 && attempt < STATUS_CONFLICT_ATTEMPTS =>
                {
                    debug!(cluster = %name, attempt, "status write conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let api = self.clusters(namespace);

        // Read existing finalizers so the patch keeps them
        let cluster = api.get(name).await?;
        let mut finalizers = cluster.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api = self.clusters(namespace);
        let Some(cluster) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = cluster
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        match api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .clusters(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn patch_secret_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "data": { key: ByteString(value) } });
        self.secrets(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(secret = %name, key, "patched secret field");
        Ok(())
    }

    async fn add_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<()> {
        let api = self.secrets(namespace);
        let secret = api.get(name).await?;
        let mut owners = secret.metadata.owner_references.unwrap_or_default();
        if owners.iter().any(|o| o.uid == owner.uid) {
            return Ok(());
        }
        owners.push(owner);

        let patch = serde_json::json!({ "metadata": { "ownerReferences": owners } });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared context for the access controllers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .overlay(Arc::new(HeadscaleClient::new(url, key)?))
///     .build();
/// ```
pub struct Context {
    /// Management cluster client (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Builds clients for managed clusters
    pub connector: Arc<dyn RemoteConnector>,
    /// Overlay control API; `None` when no overlay network is configured
    pub overlay: Option<Arc<dyn OverlayApi>>,
    /// Timing parameters
    pub config: AccessConfig,
    /// Metrics handle
    pub metrics: Metrics,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            kube,
            connector,
            overlay: None,
            config: AccessConfig::default(),
            metrics: Metrics::from_global(),
        }
    }

    /// Attach an overlay API (testing helper)
    #[cfg(test)]
    pub fn with_overlay(mut self, overlay: Arc<dyn OverlayApi>) -> Self {
        self.overlay = Some(overlay);
        self
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    connector: Option<Arc<dyn RemoteConnector>>,
    overlay: Option<Arc<dyn OverlayApi>>,
    config: AccessConfig,
    metrics: Option<Metrics>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            connector: None,
            overlay: None,
            config: AccessConfig::default(),
            metrics: None,
        }
    }

    /// Override the management cluster client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the remote connector
    pub fn connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Enable overlay access through the given control API
    pub fn overlay(mut self, overlay: Arc<dyn OverlayApi>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Set timing parameters
    pub fn config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the metrics handle
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(KubeRemoteConnector::default())),
            overlay: self.overlay,
            config: self.config,
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}
