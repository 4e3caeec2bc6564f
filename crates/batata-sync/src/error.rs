//! Error types for the coordination client

use crate::context::CancelReason;

/// Error type for coordination operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no endpoints discovered for service '{0}'")]
    Discovery(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("key '{0}' is not held")]
    NotHeld(String),

    #[error("lock '{0}' is held by another owner")]
    Locked(String),

    #[error("lease {0:x} expired")]
    LeaseExpired(i64),

    #[error("sync client is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the failure is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Transport(_))
    }
}

impl From<tonic::Status> for SyncError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        match status.code() {
            Code::Unauthenticated | Code::PermissionDenied => {
                SyncError::AuthFailed(status.message().to_string())
            }
            Code::Unavailable => SyncError::Connection(status.message().to_string()),
            // Request timeouts and server-side aborts are store failures; only
            // the caller's context produces `Cancelled`.
            code => SyncError::Transport(format!("{:?}: {}", code, status.message())),
        }
    }
}

impl From<tonic::transport::Error> for SyncError {
    fn from(err: tonic::transport::Error) -> Self {
        SyncError::Connection(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
