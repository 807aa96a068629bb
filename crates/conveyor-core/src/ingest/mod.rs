//! Ingest - リモート報告の受け口
//!
//! remote モードの StatusClient が送る push を検証し、local モードと同じ
//! `write_*` で行を作る。push ごとに独立したトランザクションでコミットする。
//!
//! # 認証
//! - database ヘッダが設定値と一致すること
//! - token ヘッダが有効な access token であること（直近の enqueue で発行）
//! - 他のセッション（Authorization ヘッダ / session cookie）を持たないこと

pub mod routes;

use std::sync::Arc;

use crate::app::engine::TaskEngine;
use crate::app::registry::ResourceRegistry;
use crate::domain::{LogId, StageId, StoreError, TaskId};
use crate::ports::{Clock, StoreTx, TaskStore};
use crate::status::local::{write_log, write_progress, write_stage};
use crate::status::wire::{LogPush, ProgressPush, StagePush};

pub use routes::{mount, router};

/// Errors surfaced to the pushing client.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("unknown database {0:?}")]
    UnknownDatabase(String),

    #[error("invalid access token")]
    InvalidToken,

    #[error("requests carrying a user session are not accepted")]
    SessionPresent,

    #[error("stage {0} does not belong to this task")]
    ForeignStage(StageId),

    #[error("task already has root stage {0}")]
    RootStageExists(StageId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a push carries besides its body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushCredentials {
    pub database: Option<String>,
    pub token: Option<String>,
    /// An `Authorization` header or a session cookie came along.
    pub session_present: bool,
}

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn TaskStore>,
    registry: Arc<ResourceRegistry>,
    clock: Arc<dyn Clock>,
    database: String,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ResourceRegistry>,
        clock: Arc<dyn Clock>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            database: database.into(),
        }
    }

    /// Service sharing the engine's store, registry and clock.
    pub fn for_engine(engine: &TaskEngine) -> Self {
        Self::new(
            engine.store(),
            engine.registry(),
            engine.clock(),
            engine.config().database.clone(),
        )
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub async fn create_stage(
        &self,
        credentials: &PushCredentials,
        push: StagePush,
    ) -> Result<StageId, IngestError> {
        let mut tx = self.store.begin().await?;
        let task_id = self.authenticate(tx.as_mut(), credentials).await?;
        match push.parent_id {
            Some(parent) => owned_stage(tx.as_mut(), task_id, parent).await?,
            None => {
                let stages = tx.stages_for_task(task_id).await?;
                if let Some(root) = stages.iter().find(|s| s.parent.is_none()) {
                    return Err(IngestError::RootStageExists(root.id));
                }
            }
        }
        let id = write_stage(tx.as_mut(), task_id, push).await?;
        tx.commit().await?;

        tracing::debug!(task_id = %task_id, stage_id = %id, "stage ingested");
        Ok(id)
    }

    pub async fn push_log(
        &self,
        credentials: &PushCredentials,
        push: LogPush,
    ) -> Result<LogId, IngestError> {
        let mut tx = self.store.begin().await?;
        let task_id = self.authenticate(tx.as_mut(), credentials).await?;
        owned_stage(tx.as_mut(), task_id, push.stage_id).await?;
        let id = write_log(tx.as_mut(), &self.registry, task_id, push, self.clock.now()).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn push_progress(
        &self,
        credentials: &PushCredentials,
        push: ProgressPush,
    ) -> Result<(), IngestError> {
        let mut tx = self.store.begin().await?;
        let task_id = self.authenticate(tx.as_mut(), credentials).await?;
        owned_stage(tx.as_mut(), task_id, push.stage_id).await?;
        write_progress(tx.as_mut(), push).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Resolve the task a push reports for.
    async fn authenticate(
        &self,
        tx: &mut dyn StoreTx,
        credentials: &PushCredentials,
    ) -> Result<TaskId, IngestError> {
        let database = non_blank(credentials.database.as_deref())
            .ok_or(IngestError::MissingHeader(crate::status::wire::DB_HEADER))?;
        let token = non_blank(credentials.token.as_deref())
            .ok_or(IngestError::MissingHeader(crate::status::wire::TOKEN_HEADER))?;
        if database != self.database {
            return Err(IngestError::UnknownDatabase(database.to_string()));
        }
        if credentials.session_present {
            tracing::warn!(database, "push rejected: user session present");
            return Err(IngestError::SessionPresent);
        }

        match tx.find_token(token).await? {
            Some(found) => Ok(found.task_id),
            None => {
                tracing::warn!(database, "push rejected: unknown token");
                Err(IngestError::InvalidToken)
            }
        }
    }
}

async fn owned_stage(
    tx: &mut dyn StoreTx,
    task_id: TaskId,
    stage_id: StageId,
) -> Result<(), IngestError> {
    match tx.get_stage(stage_id).await? {
        Some(stage) if stage.task_id == task_id => Ok(()),
        _ => Err(IngestError::ForeignStage(stage_id)),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
