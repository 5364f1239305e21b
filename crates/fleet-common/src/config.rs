//! Timing configuration for the access lifecycle engine
//!
//! All intervals are fixed: the engine never backs off exponentially so that
//! health reporting keeps a bounded latency.

use std::time::Duration;

use crate::Error;

/// Engine-wide timing parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessConfig {
    /// Validity requested for issued bearer tokens (when the cluster sets none)
    pub token_validity: Duration,
    /// Remaining validity below which a token is rotated
    ///
    /// Must be strictly shorter than `token_validity`.
    pub renewal_window: Duration,
    /// Lifetime of newly created overlay pre-auth keys
    pub pre_auth_key_validity: Duration,
    /// Minimum remaining validity for an existing pre-auth key to be reused
    pub min_pre_auth_key_validity: Duration,
    /// Steady-state requeue for drift correction
    pub requeue_interval: Duration,
    /// Requeue after a failed pass
    pub error_requeue_interval: Duration,
    /// Requeue while a deletion step is still in progress
    pub deletion_poll_interval: Duration,
    /// Requeue while waiting for an overlay machine to join
    pub join_poll_interval: Duration,
    /// Requeue for the status aggregator
    pub status_interval: Duration,
    /// Timeout for the bootstrap reachability probe
    pub probe_timeout: Duration,
    /// Port the remote API is exposed on inside the overlay network
    pub overlay_api_port: u16,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            token_validity: Duration::from_secs(48 * 3600),
            renewal_window: Duration::from_secs(12 * 3600),
            pre_auth_key_validity: Duration::from_secs(7 * 24 * 3600),
            min_pre_auth_key_validity: Duration::from_secs(24 * 3600),
            requeue_interval: Duration::from_secs(30 * 60),
            error_requeue_interval: Duration::from_secs(60),
            deletion_poll_interval: Duration::from_secs(5),
            join_poll_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(10 * 60),
            probe_timeout: Duration::from_secs(10),
            overlay_api_port: 443,
        }
    }
}

impl AccessConfig {
    /// Validate the relationships between the timing parameters
    pub fn validate(&self) -> Result<(), Error> {
        if self.token_validity.is_zero() {
            return Err(Error::config_for_field(
                "tokenValidity",
                "token validity must be positive",
            ));
        }
        if self.renewal_window >= self.token_validity {
            return Err(Error::config_for_field(
                "renewalWindow",
                format!(
                    "renewal window ({}s) must be shorter than token validity ({}s)",
                    self.renewal_window.as_secs(),
                    self.token_validity.as_secs()
                ),
            ));
        }
        if self.min_pre_auth_key_validity >= self.pre_auth_key_validity {
            return Err(Error::config_for_field(
                "minPreAuthKeyValidity",
                "minimum remaining pre-auth key validity must be shorter than key validity",
            ));
        }
        for (field, value) in [
            ("requeueInterval", self.requeue_interval),
            ("errorRequeueInterval", self.error_requeue_interval),
            ("deletionPollInterval", self.deletion_poll_interval),
            ("joinPollInterval", self.join_poll_interval),
            ("statusInterval", self.status_interval),
        ] {
            if value.is_zero() {
                return Err(Error::config_for_field(field, "interval must be positive"));
            }
        }
        Ok(())
    }

    /// Token settings for a cluster, honoring its own maximum validity
    ///
    /// A per-cluster validity at or below the renewal window would rotate on
    /// every pass, so the window is clamped to half the validity.
    pub fn token_settings(&self, max_token_validity: Option<u64>) -> TokenSettings {
        let validity = max_token_validity
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.token_validity);
        let renewal_window = if self.renewal_window >= validity {
            validity / 2
        } else {
            self.renewal_window
        };
        TokenSettings {
            validity,
            renewal_window,
        }
    }
}

/// Effective token timing for one cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenSettings {
    /// Validity requested from the token issuer
    pub validity: Duration,
    /// Rotate once remaining validity drops below this
    pub renewal_window: Duration,
}
