//! TaskEngine - タスクのライフサイクル
//!
//! # コミット境界
//! - enqueue / cancel / delete: 1 トランザクション
//! - process:
//!   1. Running 遷移を先にコミット（実行中のクラッシュが「実行中だった」と観測できる）
//!   2. payload の書き込み + Done 遷移を 1 トランザクションでコミット
//!   3. 失敗時は 2 をロールバックし、新しいトランザクションで Failed を記録
//!   4. 後続タスクの解放は終端遷移のコミット後、新しいトランザクションで行う
//!
//! process はスケジューラのコールバック境界なのでエラーを返さない。
//!
//! # 競合
//! store は他スコープが先に書き換えたタスク行の上書きを `StoreError::Conflict`
//! で拒否する。短いトランザクション（enqueue / cancel / delete / Running 遷移 /
//! 後続解放）は読み直して再試行する。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::app::registry::ResourceRegistry;
use crate::app::status::{TaskCounts, TaskSummary};
use crate::config::{EngineConfig, ReportingMode};
use crate::domain::{
    AccessToken, EngineError, ExecutionKind, LogRecord, NewTask, Principal,
    SCHEDULE_PRIORITY_BASE, ScheduleEntry, StageTree, StoreError, TaskId, TaskRecord, TaskState,
    TriggerAction, UNEXPECTED_ERROR_MESSAGE,
};
use crate::ports::{Clock, RunOptions, Runnable, StoreTx, TaskStore, TokenGenerator};
use crate::status::{LocalTransport, RemoteTransport, StatusClient, StatusError, StatusTransport};

/// Raised when `fail_on_errors` is set and the run logged errors.
pub const FINISHED_WITH_ERRORS: &str = "Task finished with errors";

/// Re-runs of a short transaction that lost a write conflict.
const CONFLICT_RETRIES: u32 = 3;

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not Queued (or gone): nothing happened.
    Skipped,

    /// Singleton check found an older active task; still Queued.
    Deferred { behind: TaskId },

    Done,

    /// Run failed; the message was recorded on the task.
    Failed { error: String },

    /// The engine could not even record the outcome (store failure).
    Aborted { error: String },
}

pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    registry: Arc<ResourceRegistry>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenGenerator>,
    config: EngineConfig,
}

impl TaskEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ResourceRegistry>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            tokens,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<ResourceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================
    // Management
    // ========================================

    /// Create a Draft task owned by the principal.
    pub async fn create_task(
        &self,
        new: NewTask,
        principal: &Principal,
    ) -> Result<TaskRecord, EngineError> {
        let mut tx = self.store.begin().await?;
        if let Some(prev) = new.run_after_task {
            load_task(tx.as_mut(), prev).await?;
        }
        let task = TaskRecord::draft(new, principal.user, self.clock.now());
        let task = tx.insert_task(task).await?;
        tx.commit().await?;

        tracing::debug!(task_id = %task.id, name = %task.name, "task created");
        Ok(task)
    }

    /// Queue a task. Returns `false` when its state does not allow it.
    pub async fn enqueue(&self, id: TaskId, principal: &Principal) -> Result<bool, EngineError> {
        let mut attempt = 0;
        loop {
            let mut tx = self.store.begin().await?;
            let queued = self.enqueue_in(tx.as_mut(), id, principal).await?;
            match tx.commit().await {
                Err(StoreError::Conflict(reason)) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::debug!(task_id = %id, attempt, %reason, "enqueue conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
                Ok(()) => return Ok(queued),
            }
        }
    }

    async fn enqueue_in(
        &self,
        tx: &mut dyn StoreTx,
        id: TaskId,
        principal: &Principal,
    ) -> Result<bool, EngineError> {
        let mut task = load_task(tx, id).await?;
        check_rights(&task, principal)?;
        if !task.state.is_enqueueable() {
            tracing::debug!(task_id = %id, state = %task.state, "enqueue skipped");
            return Ok(false);
        }

        let now = self.clock.now();
        tx.delete_stages_for_task(id).await?;
        tx.delete_logs_for_task(id).await?;
        tx.replace_token(AccessToken {
            task_id: id,
            token: self.tokens.access_token(),
            created_at: now,
        })
        .await?;

        match task.execution_kind {
            ExecutionKind::Scheduled => {
                let next_call = task.run_after.map_or(now, |at| at.max(now));
                self.register_schedule(tx, &mut task, next_call).await?;
            }
            ExecutionKind::External => {
                if let Some(sid) = task.schedule.take() {
                    tx.delete_schedule(sid).await?;
                }
                if let Some(aid) = task.action.take() {
                    tx.delete_action(aid).await?;
                }
            }
        }

        task.mark_queued(now, self.tokens.process_token())?;
        tx.update_task(&task).await?;

        tracing::info!(task_id = %id, name = %task.name, "task queued");
        Ok(true)
    }

    /// Create or re-arm the task's action and scheduler entry.
    async fn register_schedule(
        &self,
        tx: &mut dyn StoreTx,
        task: &mut TaskRecord,
        next_call: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), EngineError> {
        let label = format!("Task: {}", task.name);

        let action = match task.action {
            Some(aid) => tx.get_action(aid).await?,
            None => None,
        };
        let action = match action {
            Some(action) => action,
            None => {
                tx.insert_action(TriggerAction {
                    id: crate::domain::ActionId::new(0),
                    task_id: task.id,
                    name: label.clone(),
                    sequence: 0,
                })
                .await?
            }
        };
        task.action = Some(action.id);

        let existing = match task.schedule {
            Some(sid) => tx.get_schedule(sid).await?,
            None => None,
        };
        let entry = match existing {
            Some(mut entry) => {
                entry.name = label;
                entry.action_id = action.id;
                entry.next_call = next_call;
                entry.active = true;
                tx.update_schedule(&entry).await?;
                entry
            }
            None => {
                tx.insert_schedule(ScheduleEntry {
                    id: crate::domain::ScheduleId::new(0),
                    task_id: task.id,
                    action_id: action.id,
                    name: label,
                    next_call,
                    active: true,
                    priority: SCHEDULE_PRIORITY_BASE + task.id.get(),
                    last_call: None,
                })
                .await?
            }
        };
        task.schedule = Some(entry.id);
        Ok(())
    }

    /// Cancel a queued task. Returns `false` when it is not Queued.
    pub async fn cancel(&self, id: TaskId, principal: &Principal) -> Result<bool, EngineError> {
        let mut attempt = 0;
        loop {
            match self.try_cancel(id, principal).await {
                Err(EngineError::Store(StoreError::Conflict(reason)))
                    if attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(task_id = %id, attempt, %reason, "cancel conflicted, retrying");
                }
                other => return other,
            }
        }
    }

    async fn try_cancel(&self, id: TaskId, principal: &Principal) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut task = load_task(tx.as_mut(), id).await?;
        check_rights(&task, principal)?;
        if task.state != TaskState::Queued {
            tx.rollback().await?;
            return Ok(false);
        }

        task.mark_canceled(self.clock.now())?;
        tx.update_task(&task).await?;
        if let Some(sid) = task.schedule
            && let Some(mut entry) = tx.get_schedule(sid).await?
        {
            // keep the row for history
            entry.active = false;
            tx.update_schedule(&entry).await?;
        }
        self.release_successors(tx.as_mut(), &task).await?;
        tx.commit().await?;

        tracing::info!(task_id = %id, "task canceled");
        Ok(true)
    }

    /// Delete a task with everything it owns. Returns `false` while the
    /// task is Running; its run still holds the rows.
    pub async fn delete_task(&self, id: TaskId, principal: &Principal) -> Result<bool, EngineError> {
        let mut attempt = 0;
        loop {
            match self.try_delete(id, principal).await {
                Err(EngineError::Store(StoreError::Conflict(reason)))
                    if attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(task_id = %id, attempt, %reason, "delete conflicted, retrying");
                }
                other => return other,
            }
        }
    }

    async fn try_delete(&self, id: TaskId, principal: &Principal) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let task = load_task(tx.as_mut(), id).await?;
        check_rights(&task, principal)?;
        if task.state == TaskState::Running {
            tx.rollback().await?;
            tracing::debug!(task_id = %id, "delete refused while running");
            return Ok(false);
        }

        self.rearm_queued_successors(tx.as_mut(), id).await?;
        tx.delete_task(id).await?;
        tx.commit().await?;

        tracing::info!(task_id = %id, "task deleted");
        Ok(true)
    }

    // ========================================
    // Execution
    // ========================================

    /// Scheduler callback. Side-effect free unless the task is Queued;
    /// never returns an error.
    pub async fn process(&self, id: TaskId) -> ProcessOutcome {
        match self.try_process(id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(task_id = %id, error = ?err, "process aborted");
                ProcessOutcome::Aborted {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn try_process(&self, id: TaskId) -> Result<ProcessOutcome, EngineError> {
        let mut attempt = 0;
        let (task, runnable, options) = loop {
            match self.start(id).await {
                Ok(Start::Run {
                    task,
                    runnable,
                    options,
                }) => break (task, runnable, options),
                Ok(Start::Finished(outcome)) => return Ok(outcome),
                Err(EngineError::Store(StoreError::Conflict(reason)))
                    if attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(task_id = %id, attempt, %reason, "start conflicted, retrying");
                }
                Err(err) => return Err(err),
            }
        };

        let outcome = match self.execute(&task, runnable, options).await {
            Ok(()) => {
                tracing::info!(task_id = %id, "task done");
                ProcessOutcome::Done
            }
            Err(err) => self.record_failure(id, &err).await,
        };
        if matches!(outcome, ProcessOutcome::Done | ProcessOutcome::Failed { .. }) {
            self.continue_after(id).await;
        }
        Ok(outcome)
    }

    /// Queued check, singleton check and the committed Running transition.
    async fn start(&self, id: TaskId) -> Result<Start, EngineError> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.get_task(id).await? else {
            tx.rollback().await?;
            return Ok(Start::Finished(ProcessOutcome::Skipped));
        };
        if task.state != TaskState::Queued {
            tx.rollback().await?;
            tracing::debug!(task_id = %id, state = %task.state, "process skipped");
            return Ok(Start::Finished(ProcessOutcome::Skipped));
        }

        let resource = task.resource_ref();
        let runnable = self.registry.load(&resource);
        let options = runnable
            .as_ref()
            .and_then(|r| r.configurable().map(|c| c.run_options()))
            .unwrap_or_default();

        if options.singleton
            && let Some(first) = tx.min_active_task(task.resource_model()).await?
            && first < task.id
        {
            task.run_after_task = Some(first);
            tx.update_task(&task).await?;
            tx.commit().await?;
            tracing::info!(task_id = %id, behind = %first, "singleton busy, deferred");
            return Ok(Start::Finished(ProcessOutcome::Deferred { behind: first }));
        }

        task.mark_running(self.clock.now(), self.tokens.execution_id())?;
        tx.update_task(&task).await?;
        tx.commit().await?;
        tracing::info!(task_id = %id, name = %task.name, resource = %resource, "task running");
        Ok(Start::Run {
            task,
            runnable,
            options,
        })
    }

    /// Payload transaction: run, close the client, mark Done. Rolled back
    /// as a whole on failure.
    async fn execute(
        &self,
        task: &TaskRecord,
        runnable: Option<Arc<dyn Runnable>>,
        options: RunOptions,
    ) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        match self.run_in(tx.as_mut(), task, runnable, options).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(task_id = %task.id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn run_in(
        &self,
        tx: &mut dyn StoreTx,
        task: &TaskRecord,
        runnable: Option<Arc<dyn Runnable>>,
        options: RunOptions,
    ) -> Result<(), EngineError> {
        let runnable = runnable.ok_or_else(|| {
            EngineError::Configuration(format!("no payload for {}", task.resource_ref()))
        })?;
        let now = self.clock.now();

        {
            let transport: Box<dyn StatusTransport + '_> = match self.config.reporting {
                ReportingMode::Local => {
                    Box::new(LocalTransport::new(&mut *tx, task.id, &self.registry, now))
                }
                ReportingMode::Remote => Box::new(self.remote_transport(&mut *tx, task).await?),
            };
            let mut client = StatusClient::open(
                transport,
                task.id,
                &task.name,
                options.stages,
                self.config.mirror_logs,
            )
            .await?;

            let outcome = AssertUnwindSafe(runnable.run(&mut client))
                .catch_unwind()
                .await;
            match outcome {
                Err(panic) => return Err(EngineError::Unexpected(panic_message(panic))),
                Ok(Err(err)) => return Err(classify_payload_error(err)),
                Ok(Ok(())) => {}
            }

            if options.fail_on_errors && client.errors() > 0 {
                return Err(EngineError::Payload(FINISHED_WITH_ERRORS.to_string()));
            }
            client.close().await?;
        }

        let mut row = load_task(tx, task.id).await?;
        row.mark_done(self.clock.now())?;
        tx.update_task(&row).await?;
        Ok(())
    }

    async fn remote_transport(
        &self,
        tx: &mut dyn StoreTx,
        task: &TaskRecord,
    ) -> Result<RemoteTransport, StatusError> {
        let token = tx.token_for_task(task.id).await?.ok_or_else(|| {
            StatusError::Configuration(format!(
                "No token for task {} [{}] was generated",
                task.name,
                task.id.get()
            ))
        })?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| StatusError::Configuration("Cannot determine base URL".to_string()))?;
        RemoteTransport::new(
            base_url,
            self.config.database.clone(),
            token.token,
            self.config.http_timeout(),
        )
    }

    /// Failure path: fresh transaction, reload, mark Failed, commit.
    async fn record_failure(&self, id: TaskId, err: &EngineError) -> ProcessOutcome {
        let message = err.task_message();
        tracing::error!(task_id = %id, error = ?err, "task failed");

        match self.mark_failed(id, &message).await {
            Ok(()) => ProcessOutcome::Failed { error: message },
            Err(record_err) => {
                tracing::error!(task_id = %id, error = ?record_err, "could not record failure");
                ProcessOutcome::Aborted {
                    error: record_err.to_string(),
                }
            }
        }
    }

    async fn mark_failed(&self, id: TaskId, message: &str) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let mut task = load_task(tx.as_mut(), id).await?;
        task.mark_failed(self.clock.now(), message.to_string())?;
        tx.update_task(&task).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Release the successors of a finished run from a fresh scope, so the
    /// rows it reads are the committed ones. Failures are logged only; the
    /// run's own outcome is already committed.
    async fn continue_after(&self, id: TaskId) {
        let mut attempt = 0;
        loop {
            match self.try_continue_after(id).await {
                Ok(()) => return,
                Err(EngineError::Store(StoreError::Conflict(reason)))
                    if attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(task_id = %id, attempt, %reason, "chain release conflicted, retrying");
                }
                Err(err) => {
                    tracing::warn!(task_id = %id, error = ?err, "successors not released");
                    return;
                }
            }
        }
    }

    async fn try_continue_after(&self, id: TaskId) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let Some(task) = tx.get_task(id).await? else {
            return Ok(());
        };
        if !task.state.is_terminal() {
            return Ok(());
        }
        self.release_successors(tx.as_mut(), &task).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Let tasks waiting on `task` move on: queued ones get their scheduler
    /// entry re-armed; after Done, enqueueable ones are enqueued.
    async fn release_successors(
        &self,
        tx: &mut dyn StoreTx,
        task: &TaskRecord,
    ) -> Result<(), EngineError> {
        self.rearm_queued_successors(tx, task.id).await?;
        if task.state != TaskState::Done {
            return Ok(());
        }
        for next in tx.successors(task.id).await? {
            if next.state.is_enqueueable() {
                tracing::debug!(task_id = %next.id, after = %task.id, "continuing chain");
                self.enqueue_in(tx, next.id, &Principal::system()).await?;
            }
        }
        Ok(())
    }

    async fn rearm_queued_successors(
        &self,
        tx: &mut dyn StoreTx,
        id: TaskId,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        for next in tx.successors(id).await? {
            if next.state != TaskState::Queued {
                continue;
            }
            if let Some(sid) = next.schedule
                && let Some(mut entry) = tx.get_schedule(sid).await?
            {
                entry.active = true;
                entry.next_call = now;
                tx.update_schedule(&entry).await?;
            }
        }
        Ok(())
    }

    // ========================================
    // Reads
    // ========================================

    pub async fn task(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        let mut tx = self.store.begin().await?;
        load_task(tx.as_mut(), id).await
    }

    pub async fn stages(&self, id: TaskId) -> Result<StageTree, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(StageTree::new(tx.stages_for_task(id).await?))
    }

    /// Aggregated progress of the task's root stage.
    pub async fn progress(&self, id: TaskId) -> Result<f64, EngineError> {
        Ok(self.stages(id).await?.root_progress())
    }

    pub async fn logs(&self, id: TaskId) -> Result<Vec<LogRecord>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.logs_for_task(id).await?)
    }

    pub async fn token(&self, id: TaskId) -> Result<Option<AccessToken>, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.token_for_task(id).await?)
    }

    pub async fn schedule(&self, id: TaskId) -> Result<Option<ScheduleEntry>, EngineError> {
        let mut tx = self.store.begin().await?;
        let task = load_task(tx.as_mut(), id).await?;
        match task.schedule {
            Some(sid) => Ok(tx.get_schedule(sid).await?),
            None => Ok(None),
        }
    }

    pub async fn summary(&self, id: TaskId) -> Result<TaskSummary, EngineError> {
        let mut tx = self.store.begin().await?;
        let task = load_task(tx.as_mut(), id).await?;
        let stages = StageTree::new(tx.stages_for_task(id).await?);
        let logs = tx.logs_for_task(id).await?;
        Ok(TaskSummary::new(task, stages, &logs))
    }

    pub async fn counts_by_state(&self) -> Result<TaskCounts, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(TaskCounts::from_pairs(tx.count_by_state().await?))
    }
}

enum Start {
    Run {
        task: TaskRecord,
        runnable: Option<Arc<dyn Runnable>>,
        options: RunOptions,
    },
    Finished(ProcessOutcome),
}

pub(crate) async fn load_task(tx: &mut dyn StoreTx, id: TaskId) -> Result<TaskRecord, EngineError> {
    tx.get_task(id).await?.ok_or(EngineError::TaskNotFound(id))
}

fn check_rights(task: &TaskRecord, principal: &Principal) -> Result<(), EngineError> {
    if principal.may_manage(task.owner) {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(
            "you have to be the owner or a manager".to_string(),
        ))
    }
}

/// Reporting failures keep their class; anything else is the payload's.
fn classify_payload_error(err: anyhow::Error) -> EngineError {
    match err.downcast::<StatusError>() {
        Ok(status) => status.into(),
        Err(err) => EngineError::Payload(format!("{err:#}")),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        UNEXPECTED_ERROR_MESSAGE.to_string()
    }
}
