//! Typed access to a managed (remote) cluster
//!
//! [`RemoteCluster`] is the seam every loop talks to the member cluster
//! through; [`RemoteConnector`] turns a credential plus a [`Route`] into a
//! live client. Errors from the remote API are wrapped as
//! [`Error::Remote`] with the status code preserved.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Namespace, Node, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use fleet_common::{Error, Result, FIELD_MANAGER};

use crate::credentials::{ClusterCredential, Endpoint};

/// Default connection timeout for remote clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for remote clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Network path to a remote API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Use the server URL from the kubeconfig
    Direct,
    /// Dial the overlay address of the cluster's machine instead
    Overlay {
        /// Overlay IP of the machine fronting the API server
        address: String,
        /// Port the API server is exposed on inside the overlay
        port: u16,
    },
}

impl Route {
    /// Endpoint to dial for this route
    ///
    /// Overlay routes keep the original host as the TLS server name so the
    /// serving certificate still verifies.
    pub fn endpoint(&self, base: &Endpoint) -> Endpoint {
        match self {
            Route::Direct => base.clone(),
            Route::Overlay { address, port } => {
                let host = if address.contains(':') {
                    format!("[{address}]")
                } else {
                    address.clone()
                };
                Endpoint {
                    server: format!("https://{host}:{port}"),
                    certificate_authority_data: base.certificate_authority_data.clone(),
                    tls_server_name: base.tls_server_name.clone().or_else(|| base.host()),
                    insecure_skip_tls_verify: base.insecure_skip_tls_verify,
                }
            }
        }
    }
}

/// A bearer token returned by the remote TokenRequest API
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The token itself
    pub token: String,
    /// Expiry as reported by the issuer
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Operations the engine performs against a managed cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    /// Git version of the remote API server
    async fn server_version(&self) -> Result<String>;

    /// Get a namespace, `None` if absent
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<()>;

    /// Merge the given labels into a namespace
    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Delete a namespace; absent is not an error
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Get a service account, `None` if absent
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    /// Create a service account
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<()>;

    /// Merge the given labels into a service account
    async fn patch_service_account_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Get a cluster role binding, `None` if absent
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;

    /// Create a cluster role binding
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Overwrite labels and subjects of an existing binding
    async fn patch_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Delete a cluster role binding; absent is not an error
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    /// Issue a bearer token for a service account
    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<IssuedToken>;

    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Create or update a Secret with server-side apply
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;
}

/// Builds remote clients from credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect to the cluster described by `credential` over `route`
    async fn connect(
        &self,
        credential: &ClusterCredential,
        route: &Route,
    ) -> Result<Arc<dyn RemoteCluster>>;
}

/// Connector producing kube-rs backed remote clients
#[derive(Clone, Debug)]
pub struct KubeRemoteConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for KubeRemoteConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl KubeRemoteConnector {
    /// Create a connector with custom timeouts
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    /// Client configuration for a credential and route
    pub async fn config_for(
        &self,
        credential: &ClusterCredential,
        route: &Route,
    ) -> Result<kube::Config> {
        let mut config = credential.client_config().await?;
        if let Route::Overlay { .. } = route {
            let endpoint = route.endpoint(credential.endpoint());
            config.cluster_url = endpoint.server.parse().map_err(|e| {
                Error::credential_for(
                    credential.cluster(),
                    format!("invalid overlay server URL {}: {e}", endpoint.server),
                )
            })?;
            config.tls_server_name = endpoint.tls_server_name;
        }
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);
        Ok(config)
    }
}

#[async_trait]
impl RemoteConnector for KubeRemoteConnector {
    async fn connect(
        &self,
        credential: &ClusterCredential,
        route: &Route,
    ) -> Result<Arc<dyn RemoteCluster>> {
        let config = self.config_for(credential, route).await?;
        let client = Client::try_from(config).map_err(|e| {
            Error::credential_for(credential.cluster(), format!("failed to create client: {e}"))
        })?;
        debug!(cluster = %credential.cluster(), ?route, "connected to remote cluster");
        Ok(Arc::new(KubeRemoteCluster::new(credential.cluster(), client)))
    }
}

/// kube-rs implementation of [`RemoteCluster`]
pub struct KubeRemoteCluster {
    cluster: String,
    client: Client,
}

impl KubeRemoteCluster {
    /// Wrap a client for the named cluster
    pub fn new(cluster: impl Into<String>, client: Client) -> Self {
        Self {
            cluster: cluster.into(),
            client,
        }
    }

    fn err(&self, source: kube::Error) -> Error {
        Error::remote_kube(&self.cluster, source)
    }

    fn ok_if_missing(&self, result: kube::Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(self.err(e)),
        }
    }
}

fn labels_patch(labels: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::json!({ "metadata": { "labels": labels } })
}

#[async_trait]
impl RemoteCluster for KubeRemoteCluster {
    async fn server_version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| self.err(e))?;
        Ok(info.git_version)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(|e| self.err(e))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&labels_patch(labels)),
        )
        .await
        .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = api.delete(name, &DeleteParams::default()).await.map(|_| ());
        self.ok_if_missing(result)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(|e| self.err(e))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<()> {
        let namespace = account.namespace().ok_or_else(|| {
            Error::internal_with_context("create_service_account", "service account has no namespace")
        })?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), account)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn patch_service_account_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&labels_patch(labels)),
        )
        .await
        .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(|e| self.err(e))
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), binding)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn patch_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "labels": binding.metadata.labels },
            "subjects": binding.subjects,
        });
        api.patch(
            &binding.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let result = api.delete(name, &DeleteParams::default()).await.map(|_| ());
        self.ok_if_missing(result)
    }

    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<IssuedToken> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: Vec::new(),
                expiration_seconds: Some(expiration_seconds),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = api
            .create_token_request(service_account, &PostParams::default(), &request)
            .await
            .map_err(|e| self.err(e))?;
        let status = response.status.ok_or_else(|| {
            Error::remote_for(&self.cluster, "token request returned no status")
        })?;
        Ok(IssuedToken {
            token: status.token,
            expires_at: status.expiration_timestamp.0,
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| self.err(e))?;
        Ok(nodes.items)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().ok_or_else(|| {
            Error::internal_with_context("apply_secret", "secret has no namespace")
        })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await
        .map_err(|e| self.err(e))?;
        Ok(())
    }
}
