//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task state.
///
/// State transitions:
/// - Draft -> Queued (enqueue)
/// - Queued -> Running (process)
/// - Queued -> Canceled (cancel)
/// - Running -> Done | Failed (process)
/// - Canceled | Failed | Done -> Queued (re-enqueue)
///
/// Draft is the initial state; nothing transitions back into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, never enqueued.
    Draft,

    /// Waiting for the scheduler to fire.
    Queued,

    /// Payload is executing.
    Running,

    /// Canceled while queued.
    Canceled,

    /// Payload (or reporting) failed.
    Failed,

    /// Payload completed.
    Done,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Draft,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Canceled,
        TaskState::Failed,
        TaskState::Done,
    ];

    /// Can `enqueue` be applied from this state?
    pub fn is_enqueueable(self) -> bool {
        matches!(
            self,
            TaskState::Draft | TaskState::Canceled | TaskState::Failed | TaskState::Done
        )
    }

    /// Does this state count against the singleton check?
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }

    /// Is this a terminal state (until the next enqueue)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Canceled | TaskState::Failed | TaskState::Done
        )
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Draft | Canceled | Failed | Done, Queued) => true,
            (Queued, Running | Canceled) => true,
            (Running, Done | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Draft => "draft",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
            TaskState::Done => "done",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
