use thiserror::Error;

use crate::domain::{EngineError, StoreError};

/// Status Reporting Client failures.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Remote client cannot be built (no token, no base URL).
    #[error("{0}")]
    Configuration(String),

    /// Network-level failure.
    #[error("POST {url} failed: {message}")]
    Transport { url: String, message: String },

    /// Non-2xx response.
    #[error("POST {url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// Response body is not the expected id.
    #[error("unexpected response from {url}: {body:?}")]
    Protocol { url: String, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<StatusError> for EngineError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::Configuration(msg) => EngineError::Configuration(msg),
            StatusError::Store(err) => EngineError::Store(err),
            other @ (StatusError::Transport { .. }
            | StatusError::Status { .. }
            | StatusError::Protocol { .. }) => EngineError::Transport(other.to_string()),
        }
    }
}
