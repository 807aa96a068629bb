//! StatusTransport - where the client's pushes go.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::domain::{LogId, Priority, StageId};
use crate::status::StatusError;
use crate::status::wire::{LogPush, ProgressPush, StagePush};

/// StatusTransport は stage / log / progress の書き込み先
///
/// - **LocalTransport**: 実行中トランザクションに直接書く
/// - **RemoteTransport**: ingestion endpoint に HTTP POST
/// - **DetachedTransport**: tracing にだけ出す（ストアなしで payload を試す用）
#[async_trait]
pub trait StatusTransport: Send {
    async fn create_stage(&mut self, push: StagePush) -> Result<StageId, StatusError>;

    async fn push_log(&mut self, push: LogPush) -> Result<LogId, StatusError>;

    async fn push_progress(&mut self, push: ProgressPush) -> Result<(), StatusError>;
}

/// Writes everything to `tracing` and hands out made-up ids.
#[derive(Debug, Default)]
pub struct DetachedTransport {
    name: String,
    seq: AtomicI64,
}

impl DetachedTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: AtomicI64::new(0),
        }
    }

    fn next(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl StatusTransport for DetachedTransport {
    async fn create_stage(&mut self, push: StagePush) -> Result<StageId, StatusError> {
        let depth = if push.parent_id.is_some() { "==" } else { "=" };
        tracing::info!(logger = %self.name, "{depth} {}", push.name);
        Ok(StageId::new(self.next()))
    }

    async fn push_log(&mut self, push: LogPush) -> Result<LogId, StatusError> {
        emit(&self.name, push.priority, &push.message);
        Ok(LogId::new(self.next()))
    }

    async fn push_progress(&mut self, push: ProgressPush) -> Result<(), StatusError> {
        let status = push.status.as_deref().unwrap_or("Progress");
        tracing::info!(logger = %self.name, "{status}: {}", push.progress);
        Ok(())
    }
}

/// Mirror a log line into `tracing` at a level matching its priority.
pub(crate) fn emit(source: &str, priority: Priority, message: &str) {
    match priority {
        Priority::Debug => tracing::debug!(source, "{message}"),
        Priority::Info | Priority::Notice => tracing::info!(source, "{message}"),
        Priority::Warning => tracing::warn!(source, "{message}"),
        Priority::Error | Priority::Alert | Priority::Emergency => {
            tracing::error!(source, priority = %priority, "{message}")
        }
    }
}
