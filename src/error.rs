//! Error types for connection sharing operations.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareError {
    /// Rejected before any backend call; no state was changed.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A teardown or apply step failed. Teardown is idempotent, so retrying is safe.
    #[error("{step} failed: {message}")]
    Backend { step: String, message: String },

    #[error("{step} timed out after {}s", after.as_secs())]
    Timeout { step: String, after: Duration },

    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Permission denied. Run as root.")]
    PermissionDenied,

    #[error("Failed to parse output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShareError {
    /// Wrap any error raised while running a named backend step.
    pub fn backend(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ShareError::Backend {
            step: step.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error was the caller's fault rather than the system's.
    pub fn is_validation(&self) -> bool {
        matches!(self, ShareError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, ShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_names_step() {
        let err = ShareError::backend("apply NAT", "iptables: not found");
        assert_eq!(err.to_string(), "apply NAT failed: iptables: not found");
        assert!(!err.is_validation());
    }

    #[test]
    fn test_timeout_message() {
        let err = ShareError::Timeout {
            step: "restart access point daemons".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "restart access point daemons timed out after 30s"
        );
    }
}
