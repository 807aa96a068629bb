//! Domain and engine error types.

use crate::domain::ids::TaskId;
use crate::domain::state::TaskState;
use thiserror::Error;

/// Failures reported by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Errors surfaced by the task lifecycle engine.
///
/// The first five variants are the failure kinds a run can end with; they are
/// recorded into the task's `error` field by `process` and never leak out of
/// it. The rest are returned to callers of the management operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Payload(String),

    #[error("{0}")]
    Unexpected(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("chain cycle: {0}")]
    ChainCycle(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Message recorded on the task when a run fails with this error.
    pub fn task_message(&self) -> String {
        match self {
            EngineError::Payload(msg) | EngineError::Unexpected(msg) if !msg.trim().is_empty() => {
                msg.clone()
            }
            EngineError::Payload(_) | EngineError::Unexpected(_) => {
                UNEXPECTED_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Fallback message when a failure carries no usable text.
pub const UNEXPECTED_ERROR_MESSAGE: &str = "Unexpected error, see logs";
