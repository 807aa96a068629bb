//! Task record: lifecycle state + scheduling metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::errors::EngineError;
use crate::domain::ids::{ActionId, ScheduleId, TaskId, UserId};
use crate::domain::state::TaskState;

/// Model name a task resolves against when it has no resource reference.
pub const TASK_MODEL: &str = "conveyor.task";

/// Polymorphic pointer to a business object: `{model, id}`.
///
/// Textual form is `"model,id"`, which is also the fallback label when a
/// reference cannot be resolved to a display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub model: String,
    pub id: i64,
}

impl ResourceRef {
    pub fn new(model: impl Into<String>, id: i64) -> Self {
        Self {
            model: model.into(),
            id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.model, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource reference: {0:?}")]
pub struct ParseResourceRefError(String);

impl FromStr for ResourceRef {
    type Err = ParseResourceRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (model, id) = s
            .split_once(',')
            .ok_or_else(|| ParseResourceRefError(s.to_string()))?;
        let model = model.trim();
        if model.is_empty() {
            return Err(ParseResourceRefError(s.to_string()));
        }
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseResourceRefError(s.to_string()))?;
        Ok(Self::new(model, id))
    }
}

/// How a queued task gets fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Enqueue registers a scheduler entry + triggerable action.
    #[default]
    Scheduled,

    /// Something outside the engine calls `process`; no scheduler entry.
    External,
}

/// Persistent task row.
///
/// All state changes go through the `mark_*` methods, which reject
/// transitions the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub state_changed_at: DateTime<Utc>,

    /// Last failure message.
    pub error: Option<String>,

    pub owner: UserId,
    pub resource: Option<ResourceRef>,

    pub schedule: Option<ScheduleId>,
    pub action: Option<ActionId>,

    /// Predecessor this task waits for; consumed when the task is queued or runs.
    pub run_after_task: Option<TaskId>,
    pub run_after: Option<DateTime<Utc>>,

    /// Task that was ahead of this one when it was chained in.
    pub parent: Option<TaskId>,

    pub execution_kind: ExecutionKind,
    pub process_token: Option<String>,
    pub execution_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Draft row from a creation request. The store assigns the real id.
    pub fn draft(new: NewTask, owner: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(0),
            name: new.name,
            state: TaskState::Draft,
            state_changed_at: now,
            error: None,
            owner,
            resource: new.resource,
            schedule: None,
            action: None,
            run_after_task: new.run_after_task,
            run_after: new.run_after,
            parent: None,
            execution_kind: new.execution_kind,
            process_token: None,
            execution_id: None,
            created_at: now,
        }
    }

    /// Model the run options and payload are resolved against.
    pub fn resource_model(&self) -> &str {
        self.resource
            .as_ref()
            .map(|r| r.model.as_str())
            .unwrap_or(TASK_MODEL)
    }

    /// Resource reference, the task itself when none is set.
    pub fn resource_ref(&self) -> ResourceRef {
        self.resource
            .clone()
            .unwrap_or_else(|| ResourceRef::new(TASK_MODEL, self.id.get()))
    }

    fn transition(&mut self, next: TaskState, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.state_changed_at = now;
        Ok(())
    }

    /// Enqueue: the predecessor becomes the parent, scheduling hints are
    /// consumed and a fresh process token replaces the previous execution.
    pub fn mark_queued(
        &mut self,
        now: DateTime<Utc>,
        process_token: String,
    ) -> Result<(), EngineError> {
        self.transition(TaskState::Queued, now)?;
        self.parent = self.run_after_task.take();
        self.run_after = None;
        self.process_token = Some(process_token);
        self.execution_id = None;
        Ok(())
    }

    /// Start of a run. A predecessor set by the singleton check is consumed
    /// into `parent`.
    pub fn mark_running(
        &mut self,
        now: DateTime<Utc>,
        execution_id: String,
    ) -> Result<(), EngineError> {
        self.transition(TaskState::Running, now)?;
        self.error = None;
        if let Some(prev) = self.run_after_task.take() {
            self.parent = Some(prev);
        }
        self.execution_id = Some(execution_id);
        Ok(())
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(TaskState::Done, now)?;
        self.error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: String) -> Result<(), EngineError> {
        self.transition(TaskState::Failed, now)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(TaskState::Canceled, now)
    }
}

/// Creation request for a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub resource: Option<ResourceRef>,
    pub execution_kind: ExecutionKind,
    pub run_after_task: Option<TaskId>,
    pub run_after: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn execution_kind(mut self, kind: ExecutionKind) -> Self {
        self.execution_kind = kind;
        self
    }

    pub fn run_after_task(mut self, task: TaskId) -> Self {
        self.run_after_task = Some(task);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }
}
