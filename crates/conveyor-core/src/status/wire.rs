//! Push payloads shared by the transports and the ingestion endpoint.

use serde::{Deserialize, Serialize};

use crate::domain::{Priority, ResourceRef, StageId};

/// Header carrying the task-database identifier.
pub const DB_HEADER: &str = "x-conveyor-db";

/// Header carrying the task's access token.
pub const TOKEN_HEADER: &str = "x-conveyor-token";

pub const LOG_PATH: &str = "/log";
pub const STAGE_PATH: &str = "/stage";
pub const PROGRESS_PATH: &str = "/progress";

/// Create a stage. `parent_id: None` creates the root stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePush {
    #[serde(default)]
    pub parent_id: Option<StageId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

/// Append a log line to a stage, optionally moving the stage's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPush {
    pub stage_id: StageId,
    #[serde(default)]
    pub priority: Priority,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// Set a stage's own progress and status label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPush {
    pub stage_id: StageId,
    #[serde(default)]
    pub status: Option<String>,
    pub progress: f64,
}
