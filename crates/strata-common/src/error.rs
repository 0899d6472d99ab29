//! Error types for Strata
//!
//! Errors carry the namespace, object name, and cluster reference they
//! occurred against so the command layer can explain what went wrong.
//! Transient store failures are retried inside the store layer, conflicts
//! are retried by the protocol step that produced them, and everything else
//! surfaces to the caller.

use thiserror::Error;

use crate::kube_utils::{is_transient_status, is_transport_error};

/// Main error type for Strata operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes client error outside of a store operation
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Retryable store failure that persisted after all retries
    #[error("transient store error on {namespace}/{name}: {message}")]
    TransientStore {
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Last failure observed
        message: String,
    },

    /// Non-retryable API failure
    #[error("store error {code} on {namespace}/{name}: {message}")]
    Store {
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// HTTP status code returned by the API server
        code: u16,
        /// Message returned by the API server
        message: String,
    },

    /// Request failed on the client side before the API server answered,
    /// e.g. authentication, TLS setup or a malformed request
    #[error("request for {namespace}/{name} failed: {message}")]
    Request {
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind (Lease, ConfigMap)
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// Object already exists on create
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind (Lease, ConfigMap)
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// Optimistic concurrency race: the resource version was stale
    #[error("conflict writing {kind} {namespace}/{name}: resource version is stale")]
    Conflict {
        /// Resource kind (Lease, ConfigMap)
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// Contended lock was not acquired within the allowed wait
    #[error(
        "timed out after {waited_secs}s waiting for lock {namespace}/{name} held by {holder}"
    )]
    LockTimeout {
        /// Namespace of the lease
        namespace: String,
        /// Name of the lease
        name: String,
        /// Identity of the holder at the time of the last read
        holder: String,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// Heartbeat renewal failed while the guarded operation was running
    #[error("lock {namespace}/{name} was lost while the operation was running")]
    LockLost {
        /// Namespace of the lease
        namespace: String,
        /// Name of the lease
        name: String,
    },

    /// Cluster reference has no context mapping and none could be resolved
    #[error("unknown cluster reference '{reference}'")]
    UnknownClusterReference {
        /// The cluster reference that could not be resolved
        reference: String,
    },

    /// Remote config copies disagree between two clusters
    #[error("remote config mismatch between clusters '{cluster_a}' and '{cluster_b}' ({field} differ)")]
    RemoteConfigMismatch {
        /// Reference cluster whose copy was read first
        cluster_a: String,
        /// Cluster whose copy disagrees with the reference
        cluster_b: String,
        /// Document section that differs
        field: String,
    },

    /// Kubeconfig could not be loaded or lacks the requested context
    #[error("kubeconfig error for context '{context}': {message}")]
    Kubeconfig {
        /// Context being loaded
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document or resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Document or argument failed validation
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "consensusNodes[0].clusterReference")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for an object
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for an object
    pub fn conflict(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a transient store error
    pub fn transient(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::TransientStore {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a non-retryable client-side request error
    pub fn request(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Request {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a non-retryable store error with its status code
    pub fn store(
        namespace: impl Into<String>,
        name: impl Into<String>,
        code: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::Store {
            namespace: namespace.into(),
            name: name.into(),
            code,
            message: msg.into(),
        }
    }

    /// Create an unknown cluster reference error
    pub fn unknown_cluster(reference: impl Into<String>) -> Self {
        Self::UnknownClusterReference {
            reference: reference.into(),
        }
    }

    /// Create a kubeconfig error for a context
    pub fn kubeconfig(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
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
    /// Only transient I/O failures are retried. Conflicts are handled by the
    /// protocol step that produced them, not by blind retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => is_transient_status(ae.code),
                other => is_transport_error(other),
            },
            Error::TransientStore { .. } => true,
            _ => false,
        }
    }

    /// True for a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when a create found the object already present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_store_errors_are_retryable() {
        let err = Error::transient("ns1", "deploy-lock", "503 service unavailable");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ns1/deploy-lock"));
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        assert!(!Error::conflict("Lease", "ns1", "deploy-lock").is_retryable());
        assert!(!Error::not_found("Lease", "ns1", "deploy-lock").is_retryable());
        assert!(!Error::already_exists("Lease", "ns1", "deploy-lock").is_retryable());
        assert!(!Error::store("ns1", "deploy-lock", 403, "forbidden").is_retryable());
        assert!(!Error::validation("bad").is_retryable());
    }

    #[test]
    fn kube_client_errors_classified_by_status() {
        let forbidden = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert!(!forbidden.is_retryable());

        let unavailable = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }));
        assert!(unavailable.is_retryable());

        assert!(!Error::from(kube::Error::TlsRequired).is_retryable());
    }

    #[test]
    fn predicates_match_variants() {
        assert!(Error::not_found("ConfigMap", "ns", "cfg").is_not_found());
        assert!(Error::conflict("ConfigMap", "ns", "cfg").is_conflict());
        assert!(Error::already_exists("Lease", "ns", "l").is_already_exists());
        assert!(!Error::internal_with_context("prompt", "x").is_conflict());
    }

    #[test]
    fn mismatch_names_both_clusters() {
        let err = Error::RemoteConfigMismatch {
            cluster_a: "east".to_string(),
            cluster_b: "west".to_string(),
            field: "consensusNodes".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'east'"));
        assert!(msg.contains("'west'"));
        assert!(msg.contains("consensusNodes"));
    }
}
