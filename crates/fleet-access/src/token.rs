//! Token Lifecycle Manager
//!
//! Keeps a short-lived, service-account scoped kubeconfig in the Credential
//! Secret's `generated-kubeconfig` field. Rotation happens only once the
//! remaining validity drops below the renewal window; until then the pass is
//! a pure timestamp comparison with no remote traffic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleet_common::config::TokenSettings;
use fleet_common::crd::{FleetCluster, StatusPatch};
use fleet_common::{Error, Result};

use crate::context::KubeClient;
use crate::credentials::{Endpoint, GENERATED_KUBECONFIG_KEY};
use crate::footprint::MANAGER_NAME;
use crate::remote::{IssuedToken, RemoteCluster};

/// Result of a token reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenOutcome {
    /// The current token is still comfortably valid
    Current,
    /// A new token was issued and stored
    Rotated {
        /// Expiry reported by the issuer
        expires_at: DateTime<Utc>,
    },
}

/// Whether a token expiring at `expires_at` must be rotated at `now`
///
/// Rotate iff there is no token yet or `now > expires_at - window`.
pub fn needs_rotation(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    let Some(expires_at) = expires_at else {
        return true;
    };
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    match expires_at.checked_sub_signed(window) {
        Some(renew_at) => now > renew_at,
        None => true,
    }
}

/// Token-scoped kubeconfig written to the Credential Secret
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScopedKubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    current_context: String,
    clusters: Vec<ScopedCluster>,
    users: Vec<ScopedUser>,
    contexts: Vec<ScopedContext>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScopedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScopedUser {
    name: String,
    user: TokenUser,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenUser {
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScopedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

impl ScopedKubeconfig {
    /// Minimal kubeconfig handed to other subsystems
    ///
    /// Only server, CA data, TLS server name and the bearer token are carried;
    /// nothing else from the user's kubeconfig leaks through.
    pub fn new(cluster: &str, endpoint: &Endpoint, token: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            current_context: cluster.to_string(),
            clusters: vec![ScopedCluster {
                name: cluster.to_string(),
                cluster: ClusterEntry {
                    server: endpoint.server.clone(),
                    certificate_authority_data: endpoint.certificate_authority_data.clone(),
                    tls_server_name: endpoint.tls_server_name.clone(),
                    insecure_skip_tls_verify: endpoint.insecure_skip_tls_verify,
                },
            }],
            users: vec![ScopedUser {
                name: MANAGER_NAME.to_string(),
                user: TokenUser {
                    token: token.to_string(),
                },
            }],
            contexts: vec![ScopedContext {
                name: cluster.to_string(),
                context: ContextEntry {
                    cluster: cluster.to_string(),
                    user: MANAGER_NAME.to_string(),
                },
            }],
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
    }
}

/// Render the scoped kubeconfig for `cluster`
pub fn scoped_kubeconfig(cluster: &str, endpoint: &Endpoint, token: &str) -> Result<String> {
    ScopedKubeconfig::new(cluster, endpoint, token).to_yaml()
}

/// Rotate the scoped token if needed
///
/// `endpoint` is the endpoint the engine itself used to reach the cluster on
/// this pass, so the generated kubeconfig works over the same path. Failure
/// to issue leaves the stored credential and expiry untouched.
pub async fn reconcile_token(
    remote: &dyn RemoteCluster,
    kube: &dyn KubeClient,
    cluster: &FleetCluster,
    endpoint: &Endpoint,
    settings: TokenSettings,
    now: DateTime<Utc>,
) -> Result<TokenOutcome> {
    let expires_at = cluster.bearer_token_expiration();
    if !needs_rotation(expires_at, now, settings.renewal_window) {
        debug!(?expires_at, "bearer token still valid");
        return Ok(TokenOutcome::Current);
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace().ok_or_else(|| {
        Error::internal_with_context("reconcile_token", "FleetCluster has no namespace")
    })?;

    let expiration_seconds = i64::try_from(settings.validity.as_secs()).unwrap_or(i64::MAX);
    let IssuedToken {
        token,
        expires_at: issued_expiry,
    } = remote
        .request_token(&namespace, MANAGER_NAME, expiration_seconds)
        .await?;

    let kubeconfig = scoped_kubeconfig(&name, endpoint, &token)?;
    kube.patch_secret_data(
        &namespace,
        &name,
        GENERATED_KUBECONFIG_KEY,
        kubeconfig.into_bytes(),
    )
    .await?;
    kube.patch_status(
        &namespace,
        &name,
        &StatusPatch::default().bearer_token_expiration(issued_expiry),
    )
    .await?;

    info!(expires_at = %issued_expiry, "rotated bearer token");
    Ok(TokenOutcome::Rotated {
        expires_at: issued_expiry,
    })
}
