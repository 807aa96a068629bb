//! Status - タスクの読み取りモデル
//!
//! 進捗はステージツリーから読むたびに計算する（保持しない）。

use serde::{Deserialize, Serialize};

use crate::domain::{LogRecord, Priority, StageTree, TaskRecord, TaskState};

/// Task counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub draft: usize,
    pub queued: usize,
    pub running: usize,
    pub canceled: usize,
    pub failed: usize,
    pub done: usize,
}

impl TaskCounts {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (TaskState, usize)>) -> Self {
        let mut counts = Self::default();
        for (state, n) in pairs {
            match state {
                TaskState::Draft => counts.draft += n,
                TaskState::Queued => counts.queued += n,
                TaskState::Running => counts.running += n,
                TaskState::Canceled => counts.canceled += n,
                TaskState::Failed => counts.failed += n,
                TaskState::Done => counts.done += n,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.draft + self.queued + self.running + self.canceled + self.failed + self.done
    }
}

/// Task with its derived fields.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task: TaskRecord,

    /// Aggregate of the root stage, 0 without stages.
    pub progress: f64,

    pub total_logs: usize,
    pub total_warnings: usize,

    /// Lines at Error priority or above.
    pub total_errors: usize,

    pub total_stages: usize,

    pub stages: StageTree,
}

impl TaskSummary {
    pub fn new(task: TaskRecord, stages: StageTree, logs: &[LogRecord]) -> Self {
        let total_warnings = logs
            .iter()
            .filter(|l| l.priority == Priority::Warning)
            .count();
        let total_errors = logs.iter().filter(|l| l.priority.is_error()).count();
        Self {
            task,
            progress: stages.root_progress(),
            total_logs: logs.len(),
            total_warnings,
            total_errors,
            total_stages: stages.len(),
            stages,
        }
    }
}
