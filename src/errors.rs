//! Error types for gary4local
//!
//! One taxonomy shared by the provisioner, the supervisor and the
//! transaction coordinator. Every service-scoped variant names the
//! service it affects so a report never leaves the user guessing.

use crate::registry::ServiceId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Not enough free space under the services root
    #[error("[{service}] insufficient disk space: {required} bytes required, {available} bytes available (other services unaffected)")]
    InsufficientDiskSpace {
        service: ServiceId,
        required: u64,
        available: u64,
    },

    /// Gated artifacts need a token that is not configured
    #[error("[{service}] missing credential: set {variable} to download gated artifacts (other services unaffected)")]
    MissingCredential { service: ServiceId, variable: String },

    /// Downloaded or on-disk artifact does not match its declared digest
    #[error("[{service}] checksum mismatch for {artifact}: expected {expected}, got {actual} (other services unaffected)")]
    ChecksumMismatch {
        service: ServiceId,
        artifact: String,
        expected: String,
        actual: String,
    },

    /// Network or timeout failure while fetching an artifact
    #[error("[{service}] download of {artifact} failed: {reason} (other services unaffected)")]
    DownloadFailed {
        service: ServiceId,
        artifact: String,
        reason: String,
    },

    /// A dependency step failed; the whole environment is marked broken
    #[error("[{service}] dependency step '{step}' failed: {reason} (other services unaffected)")]
    DependencyInstallFailed {
        service: ServiceId,
        step: String,
        reason: String,
    },

    /// Start refused because the environment is not provisioned
    #[error("[{service}] environment is {status}, run the installer first")]
    EnvironmentNotReady { service: ServiceId, status: String },

    /// Start refused because something else already listens on the port
    #[error("[{service}] port {port} is already bound by another process")]
    PortInUse { service: ServiceId, port: u16 },

    /// The child process could not be spawned
    #[error("[{service}] failed to launch: {reason}")]
    LaunchFailed { service: ServiceId, reason: String },

    /// A backing service (redis for gary) is not reachable and could not be started
    #[error("[{service}] required {requirement} is unavailable: {reason}")]
    RequirementUnavailable {
        service: ServiceId,
        requirement: String,
        reason: String,
    },

    /// The service never answered its health check
    #[error("[{service}] health check did not pass after {attempts} attempts")]
    HealthCheckTimeout { service: ServiceId, attempts: u32 },

    /// The child process could not be terminated
    #[error("[{service}] failed to stop: {reason}")]
    StopFailed { service: ServiceId, reason: String },

    /// Some services were provisioned, others were not
    #[error("transaction partially failed: failed [{}], ready [{}]", join_ids(.failed), join_ids(.succeeded))]
    TransactionPartialFailure {
        failed: Vec<ServiceId>,
        succeeded: Vec<ServiceId>,
    },

    /// The installation root cannot be written
    #[error("installation root {path:?} is not writable: {reason}")]
    InstallRootUnwritable { path: PathBuf, reason: String },

    /// The persisted environment record cannot be read back
    #[error("environment state file {path:?} is corrupt or unreadable: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    /// State machine transition errors
    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// The transaction was cancelled between steps
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

fn join_ids(ids: &[ServiceId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl OrchestratorError {
    /// The service this error is scoped to, if any
    pub fn service(&self) -> Option<ServiceId> {
        use OrchestratorError::*;

        match self {
            InsufficientDiskSpace { service, .. }
            | MissingCredential { service, .. }
            | ChecksumMismatch { service, .. }
            | DownloadFailed { service, .. }
            | DependencyInstallFailed { service, .. }
            | EnvironmentNotReady { service, .. }
            | PortInUse { service, .. }
            | LaunchFailed { service, .. }
            | RequirementUnavailable { service, .. }
            | HealthCheckTimeout { service, .. }
            | StopFailed { service, .. } => Some(*service),
            _ => None,
        }
    }

    /// Errors that must abort the whole process immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InstallRootUnwritable { .. } | OrchestratorError::StateCorrupt { .. }
        )
    }

    /// Only transient network failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::DownloadFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_service() {
        let err = OrchestratorError::PortInUse {
            service: ServiceId::Terry,
            port: 8002,
        };
        assert!(err.to_string().contains("terry"));
        assert!(err.to_string().contains("8002"));
        assert_eq!(err.service(), Some(ServiceId::Terry));
    }

    #[test]
    fn test_fatal_classification() {
        let corrupt = OrchestratorError::StateCorrupt {
            path: PathBuf::from("/tmp/state.json"),
            reason: "expected value".to_string(),
        };
        assert!(corrupt.is_fatal());
        assert!(corrupt.service().is_none());

        let download = OrchestratorError::DownloadFailed {
            service: ServiceId::Jerry,
            artifact: "model.safetensors".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(!download.is_fatal());
        assert!(download.is_retryable());
    }

    #[test]
    fn test_checksum_mismatch_not_retryable() {
        let err = OrchestratorError::ChecksumMismatch {
            service: ServiceId::Gary,
            artifact: "a.bin".to_string(),
            expected: "00".to_string(),
            actual: "11".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_partial_failure_lists_services() {
        let err = OrchestratorError::TransactionPartialFailure {
            failed: vec![ServiceId::Terry],
            succeeded: vec![ServiceId::Gary, ServiceId::Jerry],
        };
        let text = err.to_string();
        assert!(text.contains("failed [terry]"));
        assert!(text.contains("ready [gary, jerry]"));
    }
}
