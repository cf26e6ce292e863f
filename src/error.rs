//! Error types for the OCI cloud operator
//!
//! Provides one structured error enum shared by the cloud client, the
//! load-balancer reconciler, the volume provisioner and the node attach
//! plumbing, plus the requeue classification consumed by the reconcile host.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cloud Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        request_id: Option<String>,
    },

    #[error("Forbidden: {message}")]
    Forbidden {
        message: String,
        request_id: Option<String>,
    },

    #[error("Transient failure: {message}")]
    TryAgain {
        message: String,
        request_id: Option<String>,
    },

    #[error("Work request {id} failed: {message}")]
    WorkRequestFailed { id: String, message: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid volume size: requested {requested_mb} MB, minimum {minimum_mb} MB")]
    InvalidSize { requested_mb: u64, minimum_mb: u64 },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    #[error("Operation already in progress for volume {volume_id}")]
    AlreadyInProgress { volume_id: String },

    // =========================================================================
    // Node-Side Errors
    // =========================================================================
    #[error("Device not found for volume {volume_id}: {reason}")]
    DeviceNotFound { volume_id: String, reason: String },

    #[error("Mount operation failed: {0}")]
    Mount(String),

    // =========================================================================
    // Programmer Errors
    // =========================================================================
    #[error("Fatal: {0}")]
    Fatal(String),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a transient error without a cloud request id.
    pub fn try_again(message: impl Into<String>) -> Self {
        Error::TryAgain {
            message: message.into(),
            request_id: None,
        }
    }

    /// Shorthand for an etag or lifecycle conflict.
    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Quota exhaustion backs off for at least a minute
            Error::QuotaExceeded { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Another worker holds the volume lock; check back shortly
            Error::AlreadyInProgress { .. } => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Validation and policy errors wait for the user to fix the object
            Error::InvalidConfiguration(_)
            | Error::InvalidSize { .. }
            | Error::Forbidden { .. }
            | Error::Fatal(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// The `opc-request-id` echoed by the cloud, for support traceability.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Error::QuotaExceeded { request_id, .. }
            | Error::Forbidden { request_id, .. }
            | Error::TryAgain { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::QuotaExceeded {
            message: "lb quota".into(),
            request_id: None,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::InvalidConfiguration("bad annotation".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::AlreadyInProgress {
            volume_id: "ocid1.volume.oc1..a".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::try_again("connection reset");
        assert!(transient.is_retryable());

        let forbidden = Error::Forbidden {
            message: "policy denies".into(),
            request_id: Some("req-1".into()),
        };
        assert!(!forbidden.is_retryable());
        assert_eq!(forbidden.request_id(), Some("req-1"));
    }
}
