//! Domain - tasks, stages, log stream and the rows owned by a task.

pub mod errors;
pub mod ids;
pub mod log;
pub mod principal;
pub mod schedule;
pub mod stage;
pub mod state;
pub mod task;
pub mod token;

pub use errors::{EngineError, StoreError, UNEXPECTED_ERROR_MESSAGE};
pub use ids::{ActionId, Id, IdMarker, LogId, ScheduleId, StageId, TaskId, UserId};
pub use log::{LogRecord, Priority};
pub use principal::Principal;
pub use schedule::{SCHEDULE_PRIORITY_BASE, ScheduleEntry, TriggerAction};
pub use stage::{StageRecord, StageTree, clamp_progress};
pub use state::TaskState;
pub use task::{ExecutionKind, NewTask, ResourceRef, TASK_MODEL, TaskRecord};
pub use token::AccessToken;
