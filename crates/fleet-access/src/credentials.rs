//! Credential Store Adapter
//!
//! Reads the user-supplied kubeconfig out of a cluster's Credential Secret
//! and extracts the connection parameters the rest of the engine needs.
//! Problems surface as [`Error::Credential`] so the status aggregator can
//! report them as `KubeConfigValid=False`.

use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig, NamedCluster};
use kube::Config;

use fleet_common::{Error, Result};

use crate::context::KubeClient;

/// Secret field holding the user-supplied kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";
/// Secret field holding the engine-generated, token-scoped kubeconfig
pub const GENERATED_KUBECONFIG_KEY: &str = "generated-kubeconfig";
/// Secret field holding an audit copy of the overlay pre-auth key
pub const OVERLAY_AUTH_KEY_FIELD: &str = "overlay-authkey";

/// Where and how to reach a cluster's API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// API server URL
    pub server: String,
    /// Base64-encoded CA bundle, as it appears in a kubeconfig
    pub certificate_authority_data: Option<String>,
    /// Name to verify the serving certificate against
    pub tls_server_name: Option<String>,
    /// Whether TLS verification is disabled
    pub insecure_skip_tls_verify: bool,
}

impl Endpoint {
    /// Host part of the server URL
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.server)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}

/// A parsed cluster credential
#[derive(Clone)]
pub struct ClusterCredential {
    cluster: String,
    kubeconfig: Kubeconfig,
    endpoint: Endpoint,
}

impl std::fmt::Debug for ClusterCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("cluster", &self.cluster)
            .field("server", &self.endpoint.server)
            .finish_non_exhaustive()
    }
}

impl ClusterCredential {
    /// Parse the `kubeconfig` field of a Credential Secret
    pub fn from_secret(cluster: &str, secret: &Secret) -> Result<Self> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .ok_or_else(|| {
                Error::credential_for(
                    cluster,
                    format!("credential secret has no '{KUBECONFIG_KEY}' field"),
                )
            })?;
        Self::from_bytes(cluster, &data.0)
    }

    /// Fetch and parse the Credential Secret of a cluster
    ///
    /// A missing Secret is a credential error like any malformed one.
    pub async fn load(kube: &dyn KubeClient, namespace: &str, name: &str) -> Result<Self> {
        let secret = kube.get_secret(namespace, name).await?.ok_or_else(|| {
            Error::credential_for(name, format!("credential secret {namespace}/{name} not found"))
        })?;
        Self::from_secret(name, &secret)
    }

    /// Parse raw kubeconfig bytes
    pub fn from_bytes(cluster: &str, data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|e| {
            Error::credential_for(cluster, format!("invalid kubeconfig UTF-8: {e}"))
        })?;
        if text.trim().is_empty() {
            return Err(Error::credential_for(cluster, "kubeconfig is empty"));
        }

        let kubeconfig: Kubeconfig = serde_yaml::from_str(text).map_err(|e| {
            Error::credential_for(cluster, format!("invalid kubeconfig YAML: {e}"))
        })?;
        let endpoint =
            resolve_endpoint(&kubeconfig).map_err(|msg| Error::credential_for(cluster, msg))?;

        if let Some(ca) = &endpoint.certificate_authority_data {
            base64::engine::general_purpose::STANDARD
                .decode(ca.trim())
                .map_err(|e| {
                    Error::credential_for(
                        cluster,
                        format!("certificate-authority-data is not valid base64: {e}"),
                    )
                })?;
        }

        Ok(Self {
            cluster: cluster.to_string(),
            kubeconfig,
            endpoint,
        })
    }

    /// Name of the cluster this credential belongs to
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Connection parameters of the selected context
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Build a kube client configuration from the kubeconfig
    pub async fn client_config(&self) -> Result<Config> {
        Config::from_custom_kubeconfig(self.kubeconfig.clone(), &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::credential_for(&self.cluster, format!("failed to build config: {e}"))
            })
    }
}

/// Resolve current-context, falling back to the first context or cluster
fn resolve_endpoint(kubeconfig: &Kubeconfig) -> std::result::Result<Endpoint, String> {
    let context = match kubeconfig.current_context.as_deref() {
        Some(name) if !name.is_empty() => Some(
            kubeconfig
                .contexts
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| format!("current-context '{name}' not found"))?,
        ),
        _ => kubeconfig.contexts.first(),
    };

    let named: &NamedCluster = match context.and_then(|c| c.context.as_ref()) {
        Some(ctx) => kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == ctx.cluster)
            .ok_or_else(|| format!("cluster '{}' not found in kubeconfig", ctx.cluster))?,
        None => kubeconfig
            .clusters
            .first()
            .ok_or_else(|| "kubeconfig defines no clusters".to_string())?,
    };

    let details = named
        .cluster
        .as_ref()
        .ok_or_else(|| format!("cluster '{}' has no connection details", named.name))?;
    let server = details
        .server
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("cluster '{}' has no server", named.name))?;

    Ok(Endpoint {
        server,
        certificate_authority_data: details.certificate_authority_data.clone(),
        tls_server_name: details.tls_server_name.clone(),
        insecure_skip_tls_verify: details.insecure_skip_tls_verify.unwrap_or(false),
    })
}
