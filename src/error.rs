//! Error types for the RGW standalone operator

use std::time::Duration;

use thiserror::Error;

use crate::rgw::ProtocolError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Operator configuration is unusable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The ObjectStore spec was rejected before convergence
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// No running gateway pod matched the selector
    #[error("no running pod found with selector {selector:?} in namespace {namespace}")]
    TargetNotFound { selector: String, namespace: String },

    /// The exec stream could not be established or broke mid-flight
    #[error("exec transport error: {0}")]
    TransportError(String),

    #[error("remote command did not finish within {0:?}")]
    ExecTimeout(Duration),

    /// The remote process exited non-zero
    #[error("remote command `{command}` failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The storage engine answered with output we cannot interpret
    #[error("multisite protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("realm token secret {0:?} not found")]
    RealmTokenSecretNotFound(String),

    #[error("giving up waiting for {what} after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },

    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("job {0} failed")]
    JobFailed(String),

    /// The reconcile pass was cancelled by its caller
    #[error("reconcile cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a quick requeue is likely to help
    ///
    /// Infrastructure hiccups and readiness waits usually resolve on their own.
    /// Protocol violations, missing secrets and bad specs need someone to fix
    /// something outside the operator first.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::TargetNotFound { .. }
            | Error::TransportError(_)
            | Error::ExecTimeout(_)
            | Error::RetriesExhausted { .. }
            | Error::Timeout { .. }
            | Error::JobFailed(_)
            | Error::Cancelled => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::SerializationError(_)
            | Error::CommandFailed { .. }
            | Error::Protocol(_)
            | Error::RealmTokenSecretNotFound(_) => false,
        }
    }
}

/// Returns true if the API rejected a create because the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists")
}

/// Returns true if an update lost an optimistic-concurrency race
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409 && e.reason == "Conflict")
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
