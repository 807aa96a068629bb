//! Access token issued per enqueue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::TaskId;

/// The one live token of a task. Replaced on every enqueue, removed with the
/// task. Remote status pushes authenticate with it instead of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub task_id: TaskId,
    pub token: String,
    pub created_at: DateTime<Utc>,
}
