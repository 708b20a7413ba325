//! Remote protocol error types.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The service could not be reached at all.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {status} - {message}")]
    Http { status: u16, message: String },

    /// The service answered with an error for this action.
    #[error("{action} failed: {message}")]
    Action { action: String, message: String },

    #[error("unexpected response to {action}: {message}")]
    Unexpected { action: String, message: String },
}

impl RemoteError {
    /// Whether the error means the service is unreachable rather than that a
    /// single request was rejected.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http { .. })
    }
}
