//! Error types for the Storage Client Operator
//!
//! Provides structured error types for the reconcile core, the resource
//! clients, and the operator runtime, plus the requeue policy derived
//! from each error.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Transport error: {0}")]
    Transport(String),

    // =========================================================================
    // Ownership Errors
    // =========================================================================
    #[error("Invalid owner: {0}")]
    OwnerInvalid(String),

    #[error("{name} is already controlled by {owner}")]
    AlreadyOwned { name: String, owner: String },

    // =========================================================================
    // Reconcile Errors
    // =========================================================================
    #[error("Invalid signal object: {0}")]
    SignalInvalid(String),

    #[error("Unsupported platform version: {version}")]
    UnsupportedPlatformVersion { version: String },

    #[error("Mutation changed the key of {kind}/{name}")]
    MutationChangedKey { kind: String, name: String },

    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    // =========================================================================
    // Encoding Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML encode error: {0}")]
    YamlEncode(#[from] serde_yaml::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
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
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Transport(_) | Error::Conflict { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Signal or parent not visible yet
            Error::ResourceNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Preconditions - wait for the next change of the signal
            Error::Configuration(_)
            | Error::OwnerInvalid(_)
            | Error::AlreadyOwned { .. }
            | Error::UnsupportedPlatformVersion { .. }
            | Error::MutationChangedKey { .. } => ErrorAction::NoRequeue,

            Error::Aggregate(errors) => errors
                .iter()
                .map(Error::action)
                .min_by_key(action_rank)
                .unwrap_or(ErrorAction::RequeueWithBackoff),

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Transport(_) | Error::Conflict { .. } => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_transient),
            _ => false,
        }
    }
}

/// Lower rank wins when several actions compete.
fn action_rank(action: &ErrorAction) -> u8 {
    match action {
        ErrorAction::RequeueWithBackoff => 0,
        ErrorAction::RequeueAfter(_) => 1,
        ErrorAction::NoRequeue => 2,
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::ResourceNotFound {
            kind: "ClusterVersion".into(),
            name: "version".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::OwnerInvalid("deployment has no uid".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Conflict {
            kind: "SecurityContextConstraints".into(),
            name: "storage-client-csi".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Transport("connection reset".into());
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_aggregate_takes_most_eager_action() {
        let err = Error::Aggregate(vec![
            Error::OwnerInvalid("gone".into()),
            Error::Transport("timeout".into()),
        ]);
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
        assert!(err.is_transient());

        let err = Error::Aggregate(vec![Error::MutationChangedKey {
            kind: "Deployment".into(),
            name: "csi-rbdplugin-provisioner".into(),
        }]);
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_aggregate_display_lists_members() {
        let err = Error::Aggregate(vec![
            Error::Transport("timeout".into()),
            Error::Internal("boom".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "2 operations failed: Transport error: timeout; Internal error: boom"
        );
    }
}
