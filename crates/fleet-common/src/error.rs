//! Error types for the Fleet access engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant maps onto one failure category of the access lifecycle:
//! credential problems, unreachable remote clusters, overlay control API
//! failures, configuration mistakes and programmer errors.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error against the management cluster
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The credential Secret is missing or cannot be turned into a client
    #[error("credential error for {cluster}: {message}")]
    Credential {
        /// Name of the cluster whose credential is unusable
        cluster: String,
        /// Description of what's wrong
        message: String,
    },

    /// A call against the managed (remote) cluster failed
    #[error("remote error for {cluster}: {message}")]
    Remote {
        /// Name of the managed cluster
        cluster: String,
        /// Description of what failed
        message: String,
        /// HTTP status code returned by the remote API server, if any
        code: Option<u16>,
    },

    /// A call against the overlay network control API failed
    #[error("overlay error [{operation}]: {message}")]
    Overlay {
        /// Operation being performed (e.g., "create_user", "list_machines")
        operation: String,
        /// Description of what failed
        message: String,
        /// HTTP status code returned by the control API, if any
        status: Option<u16>,
    },

    /// Invalid engine or cluster configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.maxTokenValidity")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl Error {
    /// Create a credential error with cluster context
    pub fn credential_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a remote error with cluster context
    pub fn remote_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            cluster: cluster.into(),
            message: msg.into(),
            code: None,
        }
    }

    /// Create a remote error from a kube-rs error raised by a remote client
    ///
    /// Keeps the API status code so callers can tell "not found" from
    /// "connection refused".
    pub fn remote_kube(cluster: impl Into<String>, source: kube::Error) -> Self {
        let code = match &source {
            kube::Error::Api(ae) => Some(ae.code),
            _ => None,
        };
        Self::Remote {
            cluster: cluster.into(),
            message: source.to_string(),
            code,
        }
    }

    /// Create an overlay control API error
    pub fn overlay(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Overlay {
            operation: operation.into(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create an overlay control API error carrying the HTTP status
    pub fn overlay_status(operation: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::Overlay {
            operation: operation.into(),
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn config_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Credential, remote and overlay failures are retried on the next pass.
    /// Configuration, serialization and internal errors need a code or
    /// config fix and are not retried blindly.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors and write conflicts
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Credential { .. } => true,
            Error::Remote { .. } => true,
            Error::Overlay { status, .. } => !matches!(
                status,
                Some(code) if (400..500).contains(code) && *code != 404 && *code != 409
            ),
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => false,
        }
    }

    /// Check if this error is a "not found" reported by a remote or local API
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Remote { code, .. } => *code == Some(404),
            Error::Overlay { status, .. } => *status == Some(404),
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Credential { cluster, .. } => Some(cluster),
            Error::Remote { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Overlay { operation, .. } => Some(operation),
            _ => None,
        }
    }
}
