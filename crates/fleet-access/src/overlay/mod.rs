//! Overlay Network Adapter
//!
//! Clusters that cannot be reached directly join an overlay VPN mesh run by
//! a Headscale-compatible control service. Each FleetCluster maps to one
//! overlay identity (user) named `<namespace>-<name>`; machines registered
//! under that identity carry the addresses the engine dials.
//!
//! [`OverlayApi`] is the control-service seam; the free functions in this
//! module implement the per-cluster lifecycle on top of it.

mod client;

pub use client::HeadscaleClient;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::OverlayMachineStatus;
use fleet_common::{Error, Result};

/// An overlay identity
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct OverlayUser {
    /// Control-service identifier
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Unique name
    pub name: String,
}

/// A machine (node) registered with the overlay
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct OverlayMachine {
    /// Control-service identifier (numeric, as a string)
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Machine name
    #[serde(default, alias = "givenName", alias = "given_name")]
    pub name: String,
    /// Whether the control service currently sees the machine
    #[serde(default)]
    pub online: bool,
    /// Overlay addresses assigned to the machine
    #[serde(default, alias = "ipAddresses")]
    pub ip_addresses: Vec<String>,
    /// Last time the machine checked in
    #[serde(default, alias = "lastSeen")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl OverlayMachine {
    fn numeric_id(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }
}

/// A pre-authentication key
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PreAuthKey {
    /// Control-service identifier
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    /// The key material
    pub key: String,
    /// Whether the key can register more than one machine
    #[serde(default)]
    pub reusable: bool,
    /// Whether machines registered with it are removed when they go offline
    #[serde(default)]
    pub ephemeral: bool,
    /// Whether the key has been used
    #[serde(default)]
    pub used: bool,
    /// Expiry
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl PreAuthKey {
    /// Whether the key can still register a machine and stays valid for at
    /// least `min_validity`
    pub fn is_usable(&self, now: DateTime<Utc>, min_validity: Duration) -> bool {
        let min_validity = chrono::Duration::from_std(min_validity).unwrap_or(chrono::Duration::MAX);
        let fresh = self
            .expiration
            .is_some_and(|exp| exp > now && exp.signed_duration_since(now) >= min_validity);
        fresh && (self.reusable || !self.used)
    }
}

/// Request body for a new pre-auth key
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NewPreAuthKey {
    /// Identity the key registers machines under
    pub user: String,
    /// Allow multiple registrations
    pub reusable: bool,
    /// Remove machines when they disconnect
    pub ephemeral: bool,
    /// Expiry
    pub expiration: DateTime<Utc>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Overlay control-service operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OverlayApi: Send + Sync {
    /// Get an identity by name
    async fn get_user(&self, name: &str) -> Result<Option<OverlayUser>>;

    /// Create an identity
    async fn create_user(&self, name: &str) -> Result<OverlayUser>;

    /// Delete an identity by id
    async fn delete_user(&self, id: &str) -> Result<()>;

    /// List machines registered under an identity
    async fn list_machines(&self, user: &str) -> Result<Vec<OverlayMachine>>;

    /// Delete a machine by id
    async fn delete_machine(&self, id: &str) -> Result<()>;

    /// List pre-auth keys of an identity
    async fn list_pre_auth_keys(&self, user: &str) -> Result<Vec<PreAuthKey>>;

    /// Create a pre-auth key
    async fn create_pre_auth_key(&self, request: &NewPreAuthKey) -> Result<PreAuthKey>;

    /// Expire a pre-auth key of an identity
    async fn expire_pre_auth_key(&self, user: &str, key: &str) -> Result<()>;
}

/// Overlay identity name for a cluster
pub fn identity_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}

/// Create the identity if it does not exist
///
/// A concurrent creation surfaces as an error from the control service; the
/// identity is looked up again before giving up.
pub async fn ensure_identity(api: &dyn OverlayApi, name: &str) -> Result<OverlayUser> {
    if let Some(user) = api.get_user(name).await? {
        return Ok(user);
    }
    match api.create_user(name).await {
        Ok(user) => {
            info!(identity = %name, "created overlay identity");
            Ok(user)
        }
        Err(e) => match api.get_user(name).await? {
            Some(user) => {
                debug!(identity = %name, error = %e, "overlay identity already exists");
                Ok(user)
            }
            None => Err(e),
        },
    }
}

/// Result of [`reconcile_pre_auth_key`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyOutcome {
    /// The key to distribute
    pub key: PreAuthKey,
    /// Whether it was created on this call
    pub created: bool,
}

/// Reuse an existing pre-auth key or create a new reusable, non-ephemeral one
///
/// Keys that a new key replaces but that have not expired yet are expired
/// afterwards. Failing to expire one is logged and does not fail the pass.
pub async fn reconcile_pre_auth_key(
    api: &dyn OverlayApi,
    user: &str,
    now: DateTime<Utc>,
    validity: Duration,
    min_validity: Duration,
) -> Result<KeyOutcome> {
    let keys = api.list_pre_auth_keys(user).await?;
    let existing = keys
        .iter()
        .filter(|k| k.is_usable(now, min_validity))
        .max_by_key(|k| k.expiration)
        .cloned();

    if let Some(key) = existing {
        debug!(identity = %user, expires = ?key.expiration, "reusing pre-auth key");
        return Ok(KeyOutcome {
            key,
            created: false,
        });
    }

    let validity = chrono::Duration::from_std(validity)
        .map_err(|e| Error::config_for_field("preAuthKeyValidity", e.to_string()))?;
    let request = NewPreAuthKey {
        user: user.to_string(),
        reusable: true,
        ephemeral: false,
        expiration: now + validity,
    };
    let key = api.create_pre_auth_key(&request).await?;
    info!(identity = %user, expires = ?key.expiration, "created pre-auth key");

    for superseded in keys
        .iter()
        .filter(|k| k.key != key.key && k.expiration.is_some_and(|exp| exp > now))
    {
        match api.expire_pre_auth_key(user, &superseded.key).await {
            Ok(()) => {
                debug!(identity = %user, id = %superseded.id, "expired superseded pre-auth key")
            }
            Err(e) => {
                warn!(identity = %user, id = %superseded.id, error = %e, "failed to expire pre-auth key")
            }
        }
    }
    Ok(KeyOutcome { key, created: true })
}

/// Pick the machine to dial: online, has an address, highest numeric id
pub fn select_reachable(machines: &[OverlayMachine]) -> Option<(&OverlayMachine, String)> {
    let mut candidates: Vec<&OverlayMachine> = machines
        .iter()
        .filter(|m| m.online && !m.ip_addresses.is_empty())
        .collect();
    candidates.sort_by_key(|m| std::cmp::Reverse(m.numeric_id()));
    candidates
        .first()
        .map(|m| (*m, m.ip_addresses[0].clone()))
}

/// Address of the cluster's reachable machine, `None` while none is online
pub async fn resolve_reachable_address(api: &dyn OverlayApi, user: &str) -> Result<Option<String>> {
    let machines = api.list_machines(user).await?;
    Ok(select_reachable(&machines).map(|(_, address)| address))
}

/// Delete every machine of an identity; `true` once none remain
pub async fn delete_machines(api: &dyn OverlayApi, user: &str) -> Result<bool> {
    let machines = api.list_machines(user).await?;
    if machines.is_empty() {
        return Ok(true);
    }
    for machine in &machines {
        info!(identity = %user, machine = %machine.id, "deleting overlay machine");
        match api.delete_machine(&machine.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(api.list_machines(user).await?.is_empty())
}

/// Delete the identity; `false` while machines remain or it still exists
pub async fn delete_identity(api: &dyn OverlayApi, user: &str) -> Result<bool> {
    let Some(identity) = api.get_user(user).await? else {
        return Ok(true);
    };
    let remaining = api.list_machines(user).await?;
    if !remaining.is_empty() {
        warn!(
            identity = %user,
            machines = remaining.len(),
            "refusing to delete overlay identity with registered machines"
        );
        return Ok(false);
    }
    match api.delete_user(&identity.id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(true),
        Err(e) => return Err(e),
    }
    info!(identity = %user, "deleted overlay identity");
    Ok(api.get_user(user).await?.is_none())
}

/// Status snapshot of the machine backing a cluster
///
/// Reports the reachable machine if there is one, otherwise the newest
/// registered machine, otherwise just the identity.
pub fn machine_snapshot(
    identity: &str,
    machines: &[OverlayMachine],
    key_expiration: Option<DateTime<Utc>>,
) -> OverlayMachineStatus {
    let machine = select_reachable(machines)
        .map(|(m, _)| m)
        .or_else(|| machines.iter().max_by_key(|m| m.numeric_id()));

    match machine {
        Some(m) => OverlayMachineStatus {
            identity: identity.to_string(),
            machine_id: Some(m.id.clone()),
            machine_name: Some(m.name.clone()).filter(|n| !n.is_empty()),
            online: m.online,
            ip_addresses: m.ip_addresses.clone(),
            last_seen: m.last_seen,
            pre_auth_key_expiration: key_expiration,
        },
        None => OverlayMachineStatus {
            identity: identity.to_string(),
            pre_auth_key_expiration: key_expiration,
            ..Default::default()
        },
    }
}
