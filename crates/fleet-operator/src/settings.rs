//! Operator settings from flags and environment
//!
//! Every interval is given in seconds. Defaults come from [`AccessConfig`].

use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use fleet_access::overlay::{HeadscaleClient, OverlayApi};
use fleet_common::{AccessConfig, Error, Result};

/// Timing and overlay settings for the access controllers
#[derive(Args, Debug, Clone)]
pub struct AccessArgs {
    /// Validity requested for issued bearer tokens
    #[arg(long, env = "FLEET_TOKEN_VALIDITY_SECS", default_value_t = AccessConfig::default().token_validity.as_secs())]
    pub token_validity_secs: u64,

    /// Remaining token validity below which a token is rotated
    #[arg(long, env = "FLEET_RENEWAL_WINDOW_SECS", default_value_t = AccessConfig::default().renewal_window.as_secs())]
    pub renewal_window_secs: u64,

    /// Lifetime of newly created overlay pre-auth keys
    #[arg(long, env = "FLEET_PRE_AUTH_KEY_VALIDITY_SECS", default_value_t = AccessConfig::default().pre_auth_key_validity.as_secs())]
    pub pre_auth_key_validity_secs: u64,

    /// Minimum remaining validity for a pre-auth key to be reused
    #[arg(long, env = "FLEET_MIN_PRE_AUTH_KEY_VALIDITY_SECS", default_value_t = AccessConfig::default().min_pre_auth_key_validity.as_secs())]
    pub min_pre_auth_key_validity_secs: u64,

    /// Steady-state requeue interval
    #[arg(long, env = "FLEET_REQUEUE_SECS", default_value_t = AccessConfig::default().requeue_interval.as_secs())]
    pub requeue_secs: u64,

    /// Requeue interval after a failed pass
    #[arg(long, env = "FLEET_ERROR_REQUEUE_SECS", default_value_t = AccessConfig::default().error_requeue_interval.as_secs())]
    pub error_requeue_secs: u64,

    /// Requeue interval while a deletion step is in progress
    #[arg(long, env = "FLEET_DELETION_POLL_SECS", default_value_t = AccessConfig::default().deletion_poll_interval.as_secs())]
    pub deletion_poll_secs: u64,

    /// Requeue interval while waiting for an overlay machine
    #[arg(long, env = "FLEET_JOIN_POLL_SECS", default_value_t = AccessConfig::default().join_poll_interval.as_secs())]
    pub join_poll_secs: u64,

    /// Requeue interval of the status aggregator
    #[arg(long, env = "FLEET_STATUS_SECS", default_value_t = AccessConfig::default().status_interval.as_secs())]
    pub status_secs: u64,

    /// Timeout of the bootstrap reachability probe
    #[arg(long, env = "FLEET_PROBE_TIMEOUT_SECS", default_value_t = AccessConfig::default().probe_timeout.as_secs())]
    pub probe_timeout_secs: u64,

    /// Port the remote API server listens on inside the overlay
    #[arg(long, env = "FLEET_OVERLAY_API_PORT", default_value_t = AccessConfig::default().overlay_api_port)]
    pub overlay_api_port: u16,

    /// Base URL of the overlay control API (overlay mode is disabled when unset)
    #[arg(long, env = "FLEET_OVERLAY_URL")]
    pub overlay_url: Option<String>,

    /// API key for the overlay control API
    #[arg(long, env = "FLEET_OVERLAY_API_KEY", hide_env_values = true)]
    pub overlay_api_key: Option<String>,
}

impl AccessArgs {
    /// Build and validate the engine timing configuration
    pub fn access_config(&self) -> Result<AccessConfig> {
        let config = AccessConfig {
            token_validity: Duration::from_secs(self.token_validity_secs),
            renewal_window: Duration::from_secs(self.renewal_window_secs),
            pre_auth_key_validity: Duration::from_secs(self.pre_auth_key_validity_secs),
            min_pre_auth_key_validity: Duration::from_secs(self.min_pre_auth_key_validity_secs),
            requeue_interval: Duration::from_secs(self.requeue_secs),
            error_requeue_interval: Duration::from_secs(self.error_requeue_secs),
            deletion_poll_interval: Duration::from_secs(self.deletion_poll_secs),
            join_poll_interval: Duration::from_secs(self.join_poll_secs),
            status_interval: Duration::from_secs(self.status_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            overlay_api_port: self.overlay_api_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Overlay control API client, if one is configured
    pub fn overlay_api(&self) -> Result<Option<Arc<dyn OverlayApi>>> {
        match (&self.overlay_url, &self.overlay_api_key) {
            (None, None) => Ok(None),
            (Some(url), Some(key)) => {
                let client = HeadscaleClient::new(url, key.clone())?;
                Ok(Some(Arc::new(client)))
            }
            (Some(_), None) => Err(Error::config_for_field(
                "overlayApiKey",
                "an overlay URL is set but no API key",
            )),
            (None, Some(_)) => Err(Error::config_for_field(
                "overlayUrl",
                "an overlay API key is set but no URL",
            )),
        }
    }
}
