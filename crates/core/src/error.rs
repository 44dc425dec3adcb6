//! Error types for Devbox.

use thiserror::Error;

/// Result type alias using Devbox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Devbox.
///
/// Failures of the code being run (unsupported language, missing tools,
/// compile or runtime errors) are not errors here; they are reported as
/// outcomes by the dispatcher.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Container Errors
    // =========================================================================
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("Container operation for workspace {workspace_id} failed while waiting: {reason}")]
    LockRejection {
        workspace_id: String,
        reason: String,
    },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container not running: {0}")]
    ContainerNotRunning(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an infrastructure error.
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Create a lock rejection for a caller that waited on a failed operation.
    pub fn lock_rejection(workspace_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LockRejection {
            workspace_id: workspace_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error means the container is already gone or already
    /// stopped, which cleanup paths treat as success.
    pub fn is_idempotent_cleanup(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_) | Self::ContainerNotRunning(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_cleanup_classification() {
        assert!(Error::ContainerNotFound("x".into()).is_idempotent_cleanup());
        assert!(Error::ContainerNotRunning("x".into()).is_idempotent_cleanup());
        assert!(!Error::infrastructure("daemon down").is_idempotent_cleanup());
    }

    #[test]
    fn test_config_error_converts() {
        let err: Error = config::ConfigError::NotFound("sandbox.idle_ttl_secs".into()).into();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_lock_rejection_message_names_workspace() {
        let err = Error::lock_rejection("ws-1", "image pull failed");
        let msg = err.to_string();
        assert!(msg.contains("ws-1"));
        assert!(msg.contains("image pull failed"));
    }
}
