//! Local transport: pushes become rows in the caller's transaction.
//!
//! The `write_*` functions are also what the ingestion endpoint applies for
//! remote pushes, so both modes produce identical rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::registry::ResourceRegistry;
use crate::domain::{
    LogId, LogRecord, ResourceRef, StageId, StageRecord, StoreError, TaskId, clamp_progress,
};
use crate::ports::StoreTx;
use crate::status::StatusError;
use crate::status::transport::StatusTransport;
use crate::status::wire::{LogPush, ProgressPush, StagePush};

/// Append the resolved label of a reference to a message.
///
/// Unresolvable references degrade to the raw `model,id` text.
pub fn expand_reference(registry: &ResourceRegistry, message: &str, reference: &ResourceRef) -> String {
    match registry.display_name(reference) {
        Some(label) => format!("{message} ({}, '{label}')", reference.id),
        None => format!("{message} ({reference})"),
    }
}

pub(crate) async fn write_stage(
    tx: &mut dyn StoreTx,
    task_id: TaskId,
    push: StagePush,
) -> Result<StageId, StoreError> {
    let stage = tx
        .insert_stage(StageRecord {
            id: StageId::new(0),
            task_id,
            parent: push.parent_id,
            name: push.name,
            status: None,
            progress: 0.0,
            total: push.total.unwrap_or(1),
        })
        .await?;
    Ok(stage.id)
}

pub(crate) async fn write_log(
    tx: &mut dyn StoreTx,
    registry: &ResourceRegistry,
    task_id: TaskId,
    push: LogPush,
    now: DateTime<Utc>,
) -> Result<LogId, StoreError> {
    if let Some(progress) = push.progress {
        tx.set_stage_progress(push.stage_id, clamp_progress(progress), None)
            .await?;
    }

    let message = match &push.reference {
        Some(reference) => expand_reference(registry, &push.message, reference),
        None => push.message,
    };
    let log = tx
        .insert_log(LogRecord {
            id: LogId::new(0),
            task_id,
            stage_id: push.stage_id,
            priority: push.priority,
            message,
            reference: push.reference,
            code: push.code,
            data: push.data,
            created_at: now,
        })
        .await?;
    Ok(log.id)
}

pub(crate) async fn write_progress(
    tx: &mut dyn StoreTx,
    push: ProgressPush,
) -> Result<(), StoreError> {
    tx.set_stage_progress(
        push.stage_id,
        clamp_progress(push.progress),
        push.status.as_deref(),
    )
    .await
}

/// Transport writing into a borrowed transaction.
pub struct LocalTransport<'t> {
    tx: &'t mut dyn StoreTx,
    task_id: TaskId,
    registry: &'t ResourceRegistry,
    now: DateTime<Utc>,
}

impl<'t> LocalTransport<'t> {
    /// `now` stamps the log lines of this run.
    pub fn new(
        tx: &'t mut dyn StoreTx,
        task_id: TaskId,
        registry: &'t ResourceRegistry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tx,
            task_id,
            registry,
            now,
        }
    }
}

#[async_trait]
impl StatusTransport for LocalTransport<'_> {
    async fn create_stage(&mut self, push: StagePush) -> Result<StageId, StatusError> {
        Ok(write_stage(&mut *self.tx, self.task_id, push).await?)
    }

    async fn push_log(&mut self, push: LogPush) -> Result<LogId, StatusError> {
        Ok(write_log(&mut *self.tx, self.registry, self.task_id, push, self.now).await?)
    }

    async fn push_progress(&mut self, push: ProgressPush) -> Result<(), StatusError> {
        Ok(write_progress(&mut *self.tx, push).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Priority, TaskRecord, UserId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ResourceProvider, Runnable, TaskStore};
    use chrono::TimeZone;
    use std::sync::Arc;

    struct Partners;

    impl ResourceProvider for Partners {
        fn model(&self) -> &str {
            "res.partner"
        }

        fn load(&self, _id: i64) -> Option<Arc<dyn Runnable>> {
            None
        }

        fn display_name(&self, id: i64) -> Option<String> {
            (id == 7).then(|| "Deco Addict".to_string())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn references_expand_or_degrade() {
        let mut registry = ResourceRegistry::new();
        registry.register(Partners).unwrap();

        assert_eq!(
            expand_reference(&registry, "Imported", &ResourceRef::new("res.partner", 7)),
            "Imported (7, 'Deco Addict')"
        );
        assert_eq!(
            expand_reference(&registry, "Imported", &ResourceRef::new("res.partner", 8)),
            "Imported (res.partner,8)"
        );
        assert_eq!(
            expand_reference(&registry, "Imported", &ResourceRef::new("unknown", 1)),
            "Imported (unknown,1)"
        );
    }

    #[tokio::test]
    async fn local_transport_writes_rows_into_the_scope() {
        let store = InMemoryTaskStore::new();
        let registry = ResourceRegistry::new();
        let mut tx = store.begin().await.unwrap();
        let task = tx
            .insert_task(TaskRecord::draft(NewTask::new("t"), UserId::new(2), now()))
            .await
            .unwrap();

        {
            let mut transport = LocalTransport::new(tx.as_mut(), task.id, &registry, now());
            let root = transport
                .create_stage(StagePush {
                    parent_id: None,
                    name: "t".into(),
                    total: Some(3),
                })
                .await
                .unwrap();
            transport
                .push_log(LogPush {
                    stage_id: root,
                    priority: Priority::Info,
                    message: "half way".into(),
                    reference: None,
                    code: Some("E1".into()),
                    data: None,
                    progress: Some(150.0),
                })
                .await
                .unwrap();
        }

        let stages = tx.stages_for_task(task.id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].total, 3);
        assert_eq!(stages[0].progress, 100.0);

        let logs = tx.logs_for_task(task.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].code.as_deref(), Some("E1"));
        assert_eq!(logs[0].created_at, now());
    }
}
