//! Common types for Fleet: CRDs, errors, configuration and metrics

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;

pub use config::AccessConfig;
pub use error::Error;
pub use metrics::Metrics;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the engine makes
pub const FIELD_MANAGER: &str = "fleet-controller";

/// Finalizer guarding remote cleanup of a FleetCluster
pub const CLEANUP_FINALIZER: &str = "fleet.dev/access-cleanup";

/// Annotation holding an RFC 3339 timestamp after which the cluster is deleted
pub const DELETE_AT_ANNOTATION: &str = "fleet.dev/delete-at";

/// Label key marking Secrets that carry a cluster credential
pub const CREDENTIAL_LABEL_KEY: &str = "fleet.dev/credential";

/// Label selector for credential Secrets (for Kubernetes API queries)
pub const CREDENTIAL_LABEL_SELECTOR: &str = "fleet.dev/credential=true";

/// Label applied to every object the engine creates in a remote cluster
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL_KEY`] on engine-owned objects
pub const MANAGED_BY_LABEL_VALUE: &str = "fleet";
