//! HTTP client for a Headscale-compatible control API
//!
//! Talks to the `/api/v1` REST gateway with a bearer API key. Non-2xx
//! responses become [`Error::Overlay`] carrying the HTTP status.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use fleet_common::{Error, Result};

use super::{NewPreAuthKey, OverlayApi, OverlayMachine, OverlayUser, PreAuthKey};

/// Default request timeout for control API calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body echoed into an error message
const MAX_ERROR_BODY: usize = 256;

#[derive(Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<OverlayUser>,
}

#[derive(Deserialize)]
struct UserResponse {
    user: OverlayUser,
}

#[derive(Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<OverlayMachine>,
}

#[derive(Deserialize)]
struct PreAuthKeysResponse {
    #[serde(default, alias = "preAuthKeys")]
    pre_auth_keys: Vec<PreAuthKey>,
}

#[derive(Deserialize)]
struct PreAuthKeyResponse {
    #[serde(alias = "preAuthKey")]
    pre_auth_key: PreAuthKey,
}

/// Headscale REST client
#[derive(Clone)]
pub struct HeadscaleClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HeadscaleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadscaleClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HeadscaleClient {
    /// Create a client for the control API at `base_url`
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;
        Self::with_client(base_url, api_key, client)
    }

    /// Create a client using a preconfigured HTTP client
    pub fn with_client(
        base_url: &str,
        api_key: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        reqwest::Url::parse(base_url).map_err(|e| {
            Error::config_for_field("overlayUrl", format!("invalid overlay URL {base_url}: {e}"))
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Error::overlay(operation, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(Error::overlay_status(
                operation,
                status.as_u16(),
                format!("{status}: {body}"),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::overlay(operation, format!("invalid response: {e}")))
    }
}

#[async_trait]
impl OverlayApi for HeadscaleClient {
    async fn get_user(&self, name: &str) -> Result<Option<OverlayUser>> {
        let request = self.client.get(self.url("user")).query(&[("name", name)]);
        let response: UsersResponse = self.send("get_user", request).await?;
        Ok(response.users.into_iter().find(|u| u.name == name))
    }

    async fn create_user(&self, name: &str) -> Result<OverlayUser> {
        let request = self
            .client
            .post(self.url("user"))
            .json(&serde_json::json!({ "name": name }));
        let response: UserResponse = self.send("create_user", request).await?;
        Ok(response.user)
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.url(&format!("user/{id}")));
        let _: serde_json::Value = self.send("delete_user", request).await?;
        Ok(())
    }

    async fn list_machines(&self, user: &str) -> Result<Vec<OverlayMachine>> {
        let request = self.client.get(self.url("node")).query(&[("user", user)]);
        let response: NodesResponse = self.send("list_machines", request).await?;
        debug!(identity = %user, count = response.nodes.len(), "listed overlay machines");
        Ok(response.nodes)
    }

    async fn delete_machine(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.url(&format!("node/{id}")));
        let _: serde_json::Value = self.send("delete_machine", request).await?;
        Ok(())
    }

    async fn list_pre_auth_keys(&self, user: &str) -> Result<Vec<PreAuthKey>> {
        let request = self
            .client
            .get(self.url("preauthkey"))
            .query(&[("user", user)]);
        let response: PreAuthKeysResponse = self.send("list_pre_auth_keys", request).await?;
        Ok(response.pre_auth_keys)
    }

    async fn create_pre_auth_key(&self, request: &NewPreAuthKey) -> Result<PreAuthKey> {
        let http = self.client.post(self.url("preauthkey")).json(request);
        let response: PreAuthKeyResponse = self.send("create_pre_auth_key", http).await?;
        Ok(response.pre_auth_key)
    }

    async fn expire_pre_auth_key(&self, user: &str, key: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url("preauthkey/expire"))
            .json(&serde_json::json!({ "user": user, "key": key }));
        let _: serde_json::Value = self.send("expire_pre_auth_key", request).await?;
        Ok(())
    }
}
