//! Metrics handle for Fleet observability
//!
//! Provides OpenTelemetry instruments for:
//! - Reconcile passes per loop and outcome
//! - Reconcile duration
//! - Bearer token issuance
//! - Overlay pre-auth key creation
//!
//! The handle is built once from a [`Meter`] and passed into each controller
//! context; there is no process-global registry.

use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Injected metrics handle shared by the access controllers
#[derive(Clone)]
pub struct Metrics {
    reconciles: Counter<u64>,
    reconcile_duration: Histogram<f64>,
    tokens_issued: Counter<u64>,
    pre_auth_keys_created: Counter<u64>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Build all instruments from the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            reconciles: meter
                .u64_counter("fleet_reconciles_total")
                .with_description("Total number of reconcile passes by loop and result")
                .with_unit("{passes}")
                .build(),
            reconcile_duration: meter
                .f64_histogram("fleet_reconcile_duration_seconds")
                .with_description("Duration of reconcile passes in seconds")
                .with_unit("s")
                .build(),
            tokens_issued: meter
                .u64_counter("fleet_tokens_issued_total")
                .with_description("Total number of bearer tokens issued")
                .with_unit("{tokens}")
                .build(),
            pre_auth_keys_created: meter
                .u64_counter("fleet_pre_auth_keys_created_total")
                .with_description("Total number of overlay pre-auth keys created")
                .with_unit("{keys}")
                .build(),
        }
    }

    /// Handle backed by the global meter provider (a no-op unless one is installed)
    pub fn from_global() -> Self {
        Self::new(&opentelemetry::global::meter("fleet"))
    }

    /// Record one reconcile pass
    ///
    /// `result` is a short label such as `done`, `retry` or `fatal`.
    pub fn record_reconcile(&self, controller: &'static str, result: &'static str, elapsed: Duration) {
        let attrs = [
            KeyValue::new("controller", controller),
            KeyValue::new("result", result),
        ];
        self.reconciles.add(1, &attrs);
        self.reconcile_duration.record(elapsed.as_secs_f64(), &attrs);
    }

    /// Record a freshly issued bearer token
    pub fn record_token_issued(&self, mode: &'static str) {
        self.tokens_issued.add(1, &[KeyValue::new("mode", mode)]);
    }

    /// Record a newly created pre-auth key
    pub fn record_pre_auth_key_created(&self) {
        self.pre_auth_keys_created.add(1, &[]);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::from_global()
    }
}
