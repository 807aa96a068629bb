//! Log stream entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::ids::{LogId, StageId, TaskId};
use crate::domain::task::ResourceRef;

/// Log priority, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Debug,
    #[default]
    Info,
    Notice,
    Warning,
    Error,
    Alert,
    Emergency,
}

impl Priority {
    /// Counts toward the run's error counter.
    pub fn is_error(self) -> bool {
        self >= Priority::Error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Debug => "debug",
            Priority::Info => "info",
            Priority::Notice => "notice",
            Priority::Warning => "warning",
            Priority::Error => "error",
            Priority::Alert => "alert",
            Priority::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority: {0:?}")]
pub struct ParsePriorityError(String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Priority::Debug),
            "info" => Ok(Priority::Info),
            "notice" => Ok(Priority::Notice),
            "warning" => Ok(Priority::Warning),
            "error" => Ok(Priority::Error),
            "alert" => Ok(Priority::Alert),
            "emergency" => Ok(Priority::Emergency),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

/// Stored log line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: LogId,
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub priority: Priority,
    pub message: String,
    pub reference: Option<ResourceRef>,
    pub code: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
