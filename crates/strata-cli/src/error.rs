//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] strata_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config file {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },

    #[error("deployment not found: {name}")]
    DeploymentNotFound { name: String },

    #[error("deployment already exists: {name}")]
    DeploymentAlreadyExists { name: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },

    #[error("aborted")]
    Aborted,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }

    pub fn deployment_not_found(name: impl Into<String>) -> Self {
        Error::DeploymentNotFound { name: name.into() }
    }

    /// Remediation shown under the error message
    pub fn hint(&self) -> Option<&'static str> {
        use strata_common::Error as Core;

        match self {
            Error::Core(Core::LockTimeout { .. }) => Some(
                "another command holds the deployment lock; check it with `strata lock status`, \
                 or clear it with `strata lock release` if its holder crashed",
            ),
            Error::Core(Core::LockLost { .. }) => Some(
                "the lock was lost while the command ran; run `strata deployment check` before retrying",
            ),
            Error::Core(Core::UnknownClusterReference { .. }) => {
                Some("map the reference with `strata cluster-ref connect <ref> --context <context>`")
            }
            Error::Core(Core::RemoteConfigMismatch { .. }) => Some(
                "member clusters disagree; compare them with `strata deployment show --cluster <ref>`",
            ),
            Error::Core(Core::Kubeconfig { .. }) => {
                Some("check --kubeconfig, STRATA_KUBECONFIG or `strata cluster-ref list`")
            }
            Error::Core(Core::Request { .. }) => {
                Some("the request never reached the API server; check the context's credentials and TLS settings")
            }
            Error::Core(e) if e.is_retryable() => {
                Some("a cluster did not respond; check connectivity and retry")
            }
            Error::DeploymentNotFound { .. } => {
                Some("deployments are created with `strata deployment create`")
            }
            _ => None,
        }
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        use strata_common::Error as Core;

        match self {
            Error::Aborted => 130,
            Error::Core(Core::LockTimeout { .. }) | Error::Core(Core::LockLost { .. }) => 3,
            Error::Core(Core::RemoteConfigMismatch { .. }) => 4,
            Error::Validation { .. } | Error::InvalidConfig { .. } => 2,
            _ => 1,
        }
    }
}
