//! Scheduler-side rows owned by a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::{ActionId, ScheduleId, TaskId};

/// Priority base for scheduler entries; the task id is added so older tasks
/// fire first within a tick.
pub const SCHEDULE_PRIORITY_BASE: i64 = 100_000;

/// Fire-once scheduler entry that calls `process` for its task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: ScheduleId,
    pub task_id: TaskId,
    pub action_id: ActionId,
    pub name: String,
    pub next_call: DateTime<Utc>,
    pub active: bool,
    pub priority: i64,
    pub last_call: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_call <= now
    }
}

/// Server action bound to a task ("process task N").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerAction {
    pub id: ActionId,
    pub task_id: TaskId,
    pub name: String,
    pub sequence: i32,
}
