//! In-memory task store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    AccessToken, ActionId, LogId, LogRecord, ScheduleEntry, ScheduleId, StageId, StageRecord,
    StoreError, TaskId, TaskRecord, TaskState, TriggerAction,
};
use crate::ports::{StoreTx, TaskStore};

/// Committed rows.
#[derive(Debug, Clone, Default)]
struct Tables {
    tasks: BTreeMap<TaskId, TaskRecord>,
    /// Bumped by every explicit insert/update of a task row.
    versions: HashMap<TaskId, u64>,
    stages: BTreeMap<StageId, StageRecord>,
    logs: BTreeMap<LogId, LogRecord>,
    /// One live token per task.
    tokens: HashMap<TaskId, AccessToken>,
    schedules: BTreeMap<ScheduleId, ScheduleEntry>,
    actions: BTreeMap<ActionId, TriggerAction>,
}

/// Journaled write. Applied to the transaction's snapshot immediately and
/// replayed onto the shared tables on commit.
#[derive(Debug, Clone)]
enum Write {
    InsertTask(TaskRecord),
    /// Skipped on replay when the row was deleted meanwhile; pointers to
    /// tasks deleted meanwhile are dropped.
    UpdateTask(TaskRecord),
    DeleteTask(TaskId),
    PutStage(StageRecord),
    SetStageProgress {
        id: StageId,
        progress: f64,
        status: Option<String>,
    },
    DeleteStagesOf(TaskId),
    PutLog(LogRecord),
    DeleteLogsOf(TaskId),
    PutToken(AccessToken),
    PutSchedule(ScheduleEntry),
    DeleteSchedule(ScheduleId),
    PutAction(TriggerAction),
    DeleteAction(ActionId),
}

impl Tables {
    fn apply(&mut self, write: Write) {
        match write {
            Write::InsertTask(task) => {
                self.versions.insert(task.id, 1);
                self.tasks.insert(task.id, task);
            }
            Write::UpdateTask(mut task) => {
                let gone = |id: Option<TaskId>| id.is_some_and(|id| !self.tasks.contains_key(&id));
                if gone(task.parent) {
                    task.parent = None;
                }
                if gone(task.run_after_task) {
                    task.run_after_task = None;
                }
                if let Some(row) = self.tasks.get_mut(&task.id) {
                    *row = task;
                    *self.versions.entry(row.id).or_default() += 1;
                }
            }
            Write::DeleteTask(id) => self.delete_task(id),
            Write::PutStage(stage) => {
                self.stages.insert(stage.id, stage);
            }
            Write::SetStageProgress {
                id,
                progress,
                status,
            } => {
                if let Some(stage) = self.stages.get_mut(&id) {
                    stage.progress = progress;
                    if status.is_some() {
                        stage.status = status;
                    }
                }
            }
            Write::DeleteStagesOf(task) => self.stages.retain(|_, s| s.task_id != task),
            Write::PutLog(log) => {
                self.logs.insert(log.id, log);
            }
            Write::DeleteLogsOf(task) => self.logs.retain(|_, l| l.task_id != task),
            Write::PutToken(token) => {
                self.tokens.insert(token.task_id, token);
            }
            Write::PutSchedule(entry) => {
                self.schedules.insert(entry.id, entry);
            }
            Write::DeleteSchedule(id) => {
                self.schedules.remove(&id);
            }
            Write::PutAction(action) => {
                self.actions.insert(action.id, action);
            }
            Write::DeleteAction(id) => {
                self.actions.remove(&id);
            }
        }
    }

    /// Task a write belongs to, for rows that hang off a task.
    fn owner_of(write: &Write) -> Option<TaskId> {
        match write {
            Write::PutStage(stage) => Some(stage.task_id),
            Write::PutLog(log) => Some(log.task_id),
            Write::PutToken(token) => Some(token.task_id),
            Write::PutSchedule(entry) => Some(entry.task_id),
            Write::PutAction(action) => Some(action.task_id),
            _ => None,
        }
    }

    fn delete_task(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        self.versions.remove(&id);

        self.stages.retain(|_, s| s.task_id != id);
        self.logs.retain(|_, l| l.task_id != id);
        self.tokens.remove(&id);
        self.schedules
            .retain(|sid, e| e.task_id != id && Some(*sid) != task.schedule);
        self.actions
            .retain(|aid, a| a.task_id != id && Some(*aid) != task.action);

        for other in self.tasks.values_mut() {
            if other.run_after_task == Some(id) {
                other.run_after_task = task.run_after_task;
            }
            if other.parent == Some(id) {
                other.parent = None;
            }
        }
    }
}

/// Id sequences, shared by all scopes and never rolled back.
#[derive(Debug, Default)]
struct Sequences {
    task: AtomicI64,
    stage: AtomicI64,
    log: AtomicI64,
    schedule: AtomicI64,
    action: AtomicI64,
}

fn next(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::Relaxed) + 1
}

/// In-memory implementation of [`TaskStore`].
///
/// Design:
/// - `begin` snapshots the committed tables; reads inside a scope see the
///   snapshot plus the scope's own writes.
/// - Writes are journaled; `commit` replays the journal onto the committed
///   tables, so rows committed by other scopes in the meantime survive.
/// - Task rows are optimistic: `commit` fails with [`StoreError::Conflict`]
///   and applies nothing when a task row the scope updated or deleted was
///   updated by another scope since `begin`, or when a row the scope wrote
///   hangs off a task that is gone. Chain splices of a delete cascade do not
///   count as updates.
/// - `rollback` (or dropping the scope) discards the journal.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tables: Arc<Mutex<Tables>>,
    seq: Arc<Sequences>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let snapshot = self.tables.lock().await.clone();
        Ok(Box::new(InMemoryTx {
            shared: Arc::clone(&self.tables),
            seq: Arc::clone(&self.seq),
            base: snapshot.versions.clone(),
            work: snapshot,
            journal: Vec::new(),
        }))
    }
}

/// Transaction scope of [`InMemoryTaskStore`].
pub struct InMemoryTx {
    shared: Arc<Mutex<Tables>>,
    seq: Arc<Sequences>,
    /// Task row versions as of `begin`.
    base: HashMap<TaskId, u64>,
    work: Tables,
    journal: Vec<Write>,
}

impl InMemoryTx {
    fn record(&mut self, write: Write) {
        self.work.apply(write.clone());
        self.journal.push(write);
    }

    fn require_task(&self, id: TaskId) -> Result<&TaskRecord, StoreError> {
        self.work
            .tasks
            .get(&id)
            .ok_or_else(|| StoreError::not_found("task", id.get()))
    }

    /// Check the journal against the committed tables.
    fn validate(&self, tables: &Tables) -> Result<(), StoreError> {
        let inserted: HashSet<TaskId> = self
            .journal
            .iter()
            .filter_map(|w| match w {
                Write::InsertTask(task) => Some(task.id),
                _ => None,
            })
            .collect();

        let mut checked = HashSet::new();
        for write in &self.journal {
            let id = match write {
                Write::UpdateTask(task) => task.id,
                Write::DeleteTask(id) => *id,
                other => {
                    if let Some(owner) = Tables::owner_of(other)
                        && !inserted.contains(&owner)
                        && !tables.tasks.contains_key(&owner)
                    {
                        return Err(StoreError::Conflict(format!(
                            "task {owner} was deleted by another scope"
                        )));
                    }
                    continue;
                }
            };
            if inserted.contains(&id) || !checked.insert(id) {
                continue;
            }
            if tables.versions.get(&id) != self.base.get(&id) {
                return Err(StoreError::Conflict(format!(
                    "task {id} was changed by another scope"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn insert_task(&mut self, mut task: TaskRecord) -> Result<TaskRecord, StoreError> {
        task.id = TaskId::new(next(&self.seq.task));
        self.record(Write::InsertTask(task.clone()));
        Ok(task)
    }

    async fn get_task(&mut self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.work.tasks.get(&id).cloned())
    }

    async fn update_task(&mut self, task: &TaskRecord) -> Result<(), StoreError> {
        self.require_task(task.id)?;
        self.record(Write::UpdateTask(task.clone()));
        Ok(())
    }

    async fn delete_task(&mut self, id: TaskId) -> Result<bool, StoreError> {
        if !self.work.tasks.contains_key(&id) {
            return Ok(false);
        }
        self.record(Write::DeleteTask(id));
        Ok(true)
    }

    async fn list_tasks(&mut self) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.work.tasks.values().cloned().collect())
    }

    async fn min_active_task(&mut self, model: &str) -> Result<Option<TaskId>, StoreError> {
        Ok(self
            .work
            .tasks
            .values()
            .filter(|t| t.state.is_active() && t.resource_model() == model)
            .map(|t| t.id)
            .min())
    }

    async fn successors(&mut self, id: TaskId) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .work
            .tasks
            .values()
            .filter(|t| t.run_after_task == Some(id))
            .cloned()
            .collect())
    }

    async fn chain_from(&mut self, id: TaskId) -> Result<Vec<TaskId>, StoreError> {
        if !self.work.tasks.contains_key(&id) {
            return Ok(Vec::new());
        }

        let mut waiting: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in self.work.tasks.values() {
            if let Some(prev) = task.run_after_task {
                waiting.entry(prev).or_default().push(task.id);
            }
        }

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            if let Some(next) = waiting.get(&current) {
                queue.extend(next.iter().copied());
            }
        }
        Ok(out)
    }

    async fn count_by_state(&mut self) -> Result<Vec<(TaskState, usize)>, StoreError> {
        Ok(TaskState::ALL
            .iter()
            .map(|state| {
                let n = self
                    .work
                    .tasks
                    .values()
                    .filter(|t| t.state == *state)
                    .count();
                (*state, n)
            })
            .collect())
    }

    async fn insert_stage(&mut self, mut stage: StageRecord) -> Result<StageRecord, StoreError> {
        self.require_task(stage.task_id)?;
        if stage.parent.is_none()
            && let Some(root) = self
                .work
                .stages
                .values()
                .find(|s| s.task_id == stage.task_id && s.parent.is_none())
        {
            return Err(StoreError::Conflict(format!(
                "task {} already has root stage {}",
                stage.task_id, root.id
            )));
        }
        if let Some(parent) = stage.parent {
            match self.work.stages.get(&parent) {
                Some(p) if p.task_id == stage.task_id => {}
                Some(_) => {
                    return Err(StoreError::Conflict(format!(
                        "parent stage {parent} belongs to another task"
                    )));
                }
                None => return Err(StoreError::not_found("stage", parent.get())),
            }
        }
        stage.id = StageId::new(next(&self.seq.stage));
        self.record(Write::PutStage(stage.clone()));
        Ok(stage)
    }

    async fn get_stage(&mut self, id: StageId) -> Result<Option<StageRecord>, StoreError> {
        Ok(self.work.stages.get(&id).cloned())
    }

    async fn set_stage_progress(
        &mut self,
        id: StageId,
        progress: f64,
        status: Option<&str>,
    ) -> Result<(), StoreError> {
        if !self.work.stages.contains_key(&id) {
            return Err(StoreError::not_found("stage", id.get()));
        }
        self.record(Write::SetStageProgress {
            id,
            progress,
            status: status.map(str::to_string),
        });
        Ok(())
    }

    async fn stages_for_task(&mut self, task: TaskId) -> Result<Vec<StageRecord>, StoreError> {
        Ok(self
            .work
            .stages
            .values()
            .filter(|s| s.task_id == task)
            .cloned()
            .collect())
    }

    async fn delete_stages_for_task(&mut self, task: TaskId) -> Result<usize, StoreError> {
        let n = self
            .work
            .stages
            .values()
            .filter(|s| s.task_id == task)
            .count();
        // journaled even when empty here: rows committed since `begin` go too
        self.record(Write::DeleteStagesOf(task));
        Ok(n)
    }

    async fn insert_log(&mut self, mut log: LogRecord) -> Result<LogRecord, StoreError> {
        self.require_task(log.task_id)?;
        if !self.work.stages.contains_key(&log.stage_id) {
            return Err(StoreError::not_found("stage", log.stage_id.get()));
        }
        log.id = LogId::new(next(&self.seq.log));
        self.record(Write::PutLog(log.clone()));
        Ok(log)
    }

    async fn logs_for_task(&mut self, task: TaskId) -> Result<Vec<LogRecord>, StoreError> {
        Ok(self
            .work
            .logs
            .values()
            .filter(|l| l.task_id == task)
            .cloned()
            .collect())
    }

    async fn delete_logs_for_task(&mut self, task: TaskId) -> Result<usize, StoreError> {
        let n = self
            .work
            .logs
            .values()
            .filter(|l| l.task_id == task)
            .count();
        // journaled even when empty here: rows committed since `begin` go too
        self.record(Write::DeleteLogsOf(task));
        Ok(n)
    }

    async fn replace_token(&mut self, token: AccessToken) -> Result<(), StoreError> {
        self.require_task(token.task_id)?;
        self.record(Write::PutToken(token));
        Ok(())
    }

    async fn token_for_task(&mut self, task: TaskId) -> Result<Option<AccessToken>, StoreError> {
        Ok(self.work.tokens.get(&task).cloned())
    }

    async fn find_token(&mut self, token: &str) -> Result<Option<AccessToken>, StoreError> {
        Ok(self
            .work
            .tokens
            .values()
            .find(|t| t.token == token)
            .cloned())
    }

    async fn insert_schedule(
        &mut self,
        mut entry: ScheduleEntry,
    ) -> Result<ScheduleEntry, StoreError> {
        self.require_task(entry.task_id)?;
        entry.id = ScheduleId::new(next(&self.seq.schedule));
        self.record(Write::PutSchedule(entry.clone()));
        Ok(entry)
    }

    async fn get_schedule(&mut self, id: ScheduleId) -> Result<Option<ScheduleEntry>, StoreError> {
        Ok(self.work.schedules.get(&id).cloned())
    }

    async fn update_schedule(&mut self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        if !self.work.schedules.contains_key(&entry.id) {
            return Err(StoreError::not_found("schedule", entry.id.get()));
        }
        self.record(Write::PutSchedule(entry.clone()));
        Ok(())
    }

    async fn delete_schedule(&mut self, id: ScheduleId) -> Result<(), StoreError> {
        if self.work.schedules.contains_key(&id) {
            self.record(Write::DeleteSchedule(id));
        }
        Ok(())
    }

    async fn due_schedules(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut due: Vec<ScheduleEntry> = self
            .work
            .schedules
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.priority, e.id));
        Ok(due)
    }

    async fn insert_action(
        &mut self,
        mut action: TriggerAction,
    ) -> Result<TriggerAction, StoreError> {
        self.require_task(action.task_id)?;
        action.id = ActionId::new(next(&self.seq.action));
        self.record(Write::PutAction(action.clone()));
        Ok(action)
    }

    async fn get_action(&mut self, id: ActionId) -> Result<Option<TriggerAction>, StoreError> {
        Ok(self.work.actions.get(&id).cloned())
    }

    async fn delete_action(&mut self, id: ActionId) -> Result<(), StoreError> {
        if self.work.actions.contains_key(&id) {
            self.record(Write::DeleteAction(id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if this.journal.is_empty() {
            return Ok(());
        }
        let mut tables = this.shared.lock().await;
        this.validate(&tables)?;
        for write in this.journal {
            tables.apply(write);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Priority, ResourceRef, UserId};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn draft(name: &str) -> TaskRecord {
        TaskRecord::draft(NewTask::new(name), UserId::new(2), now())
    }

    fn stage(task: TaskId, parent: Option<StageId>, name: &str) -> StageRecord {
        StageRecord {
            id: StageId::new(0),
            task_id: task,
            parent,
            name: name.into(),
            status: None,
            progress: 0.0,
            total: 1,
        }
    }

    fn log(task: TaskId, stage: StageId, message: &str) -> LogRecord {
        LogRecord {
            id: LogId::new(0),
            task_id: task,
            stage_id: stage,
            priority: Priority::Info,
            message: message.into(),
            reference: None,
            code: None,
            data: None,
            created_at: now(),
        }
    }

    async fn insert_committed(store: &InMemoryTaskStore, task: TaskRecord) -> TaskRecord {
        let mut tx = store.begin().await.unwrap();
        let task = tx.insert_task(task).await.unwrap();
        tx.commit().await.unwrap();
        task
    }

    #[tokio::test]
    async fn commit_publishes_and_rollback_discards() {
        let store = InMemoryTaskStore::new();

        let mut tx = store.begin().await.unwrap();
        let kept = tx.insert_task(draft("kept")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let lost = tx.insert_task(draft("lost")).await.unwrap();
        // visible inside its own scope
        assert!(tx.get_task(lost.id).await.unwrap().is_some());
        tx.rollback().await.unwrap();

        {
            let mut dropped = store.begin().await.unwrap();
            dropped.insert_task(draft("dropped")).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let all = tx.list_tasks().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, kept.id);
        assert!(tx.get_task(lost.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_rollback() {
        let store = InMemoryTaskStore::new();

        let mut tx = store.begin().await.unwrap();
        let first = tx.insert_task(draft("a")).await.unwrap();
        tx.rollback().await.unwrap();

        let second = insert_committed(&store, draft("b")).await;
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn concurrent_scopes_merge_on_commit() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut tx = store.begin().await.unwrap();
        let root = tx.insert_stage(stage(task.id, None, "root")).await.unwrap();
        tx.commit().await.unwrap();

        // long-running scope
        let mut outer = store.begin().await.unwrap();

        // another scope logs and commits meanwhile
        let mut ingest = store.begin().await.unwrap();
        ingest.insert_log(log(task.id, root.id, "remote")).await.unwrap();
        ingest.commit().await.unwrap();

        let mut row = outer.get_task(task.id).await.unwrap().unwrap();
        row.name = "renamed".into();
        outer.update_task(&row).await.unwrap();
        outer.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_task(task.id).await.unwrap().unwrap().name, "renamed");
        assert_eq!(tx.logs_for_task(task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_task_update_is_a_conflict() {
        let store = InMemoryTaskStore::new();
        let mut queued = draft("t");
        queued.state = TaskState::Queued;
        let task = insert_committed(&store, queued).await;

        let mut slow = store.begin().await.unwrap();
        let mut stale = slow.get_task(task.id).await.unwrap().unwrap();

        let mut fast = store.begin().await.unwrap();
        let mut row = fast.get_task(task.id).await.unwrap().unwrap();
        row.state = TaskState::Running;
        fast.update_task(&row).await.unwrap();
        fast.commit().await.unwrap();

        stale.state = TaskState::Canceled;
        slow.update_task(&stale).await.unwrap();
        let err = slow.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.get_task(task.id).await.unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn conflicting_commit_applies_nothing() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut slow = store.begin().await.unwrap();
        let root = slow.insert_stage(stage(task.id, None, "root")).await.unwrap();
        let mut row = slow.get_task(task.id).await.unwrap().unwrap();
        row.name = "slow".into();
        slow.update_task(&row).await.unwrap();

        let mut fast = store.begin().await.unwrap();
        let mut row = fast.get_task(task.id).await.unwrap().unwrap();
        row.name = "fast".into();
        fast.update_task(&row).await.unwrap();
        fast.commit().await.unwrap();

        assert!(slow.commit().await.is_err());

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_task(task.id).await.unwrap().unwrap().name, "fast");
        assert!(tx.get_stage(root.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clearing_a_task_reaches_rows_committed_after_begin() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut reset = store.begin().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let root = tx.insert_stage(stage(task.id, None, "root")).await.unwrap();
        tx.insert_log(log(task.id, root.id, "late")).await.unwrap();
        tx.commit().await.unwrap();

        // nothing to clear in this scope's snapshot
        assert_eq!(reset.delete_stages_for_task(task.id).await.unwrap(), 0);
        assert_eq!(reset.delete_logs_for_task(task.id).await.unwrap(), 0);
        reset.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.stages_for_task(task.id).await.unwrap().is_empty());
        assert!(tx.logs_for_task(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rows_of_a_task_deleted_meanwhile_are_refused() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut run = store.begin().await.unwrap();
        let root = run.insert_stage(stage(task.id, None, "root")).await.unwrap();
        run.insert_log(log(task.id, root.id, "line")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.delete_task(task.id).await.unwrap();
        tx.commit().await.unwrap();

        let err = run.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.stages_for_task(task.id).await.unwrap().is_empty());
        assert!(tx.logs_for_task(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_splice_does_not_conflict_with_successor_update() {
        let store = InMemoryTaskStore::new();
        let a = insert_committed(&store, draft("a")).await;
        let mut b = draft("b");
        b.parent = Some(a.id);
        let b = insert_committed(&store, b).await;

        let mut run = store.begin().await.unwrap();
        let mut row = run.get_task(b.id).await.unwrap().unwrap();
        row.name = "b2".into();
        run.update_task(&row).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.delete_task(a.id).await.unwrap();
        tx.commit().await.unwrap();

        run.commit().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let b = tx.get_task(b.id).await.unwrap().unwrap();
        assert_eq!(b.name, "b2");
        assert_eq!(b.parent, None);
    }

    #[tokio::test]
    async fn a_task_has_one_root_stage() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut tx = store.begin().await.unwrap();
        let root = tx.insert_stage(stage(task.id, None, "root")).await.unwrap();
        let err = tx
            .insert_stage(stage(task.id, None, "second"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        tx.insert_stage(stage(task.id, Some(root.id), "child"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_of_unknown_task_fails() {
        let store = InMemoryTaskStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut ghost = draft("ghost");
        ghost.id = TaskId::new(99);

        let err = tx.update_task(&ghost).await.unwrap_err();
        assert_eq!(err, StoreError::not_found("task", 99));
    }

    #[tokio::test]
    async fn delete_cascades_and_splices_chain() {
        let store = InMemoryTaskStore::new();
        let a = insert_committed(&store, draft("a")).await;
        let mut b = draft("b");
        b.run_after_task = Some(a.id);
        let b = insert_committed(&store, b).await;
        let mut c = draft("c");
        c.run_after_task = Some(b.id);
        c.parent = Some(b.id);
        let c = insert_committed(&store, c).await;

        let mut tx = store.begin().await.unwrap();
        let root = tx.insert_stage(stage(b.id, None, "root")).await.unwrap();
        tx.insert_log(log(b.id, root.id, "line")).await.unwrap();
        tx.replace_token(AccessToken {
            task_id: b.id,
            token: "tok".into(),
            created_at: now(),
        })
        .await
        .unwrap();
        let action = tx
            .insert_action(TriggerAction {
                id: ActionId::new(0),
                task_id: b.id,
                name: "Task b".into(),
                sequence: 0,
            })
            .await
            .unwrap();
        let entry = tx
            .insert_schedule(ScheduleEntry {
                id: ScheduleId::new(0),
                task_id: b.id,
                action_id: action.id,
                name: "Task b".into(),
                next_call: now(),
                active: true,
                priority: 100_000 + b.id.get(),
                last_call: None,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.delete_task(b.id).await.unwrap());
        assert!(!tx.delete_task(b.id).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.stages_for_task(b.id).await.unwrap().is_empty());
        assert!(tx.logs_for_task(b.id).await.unwrap().is_empty());
        assert!(tx.token_for_task(b.id).await.unwrap().is_none());
        assert!(tx.find_token("tok").await.unwrap().is_none());
        assert!(tx.get_schedule(entry.id).await.unwrap().is_none());
        assert!(tx.get_action(action.id).await.unwrap().is_none());

        let c = tx.get_task(c.id).await.unwrap().unwrap();
        assert_eq!(c.run_after_task, Some(a.id));
        assert_eq!(c.parent, None);
    }

    #[tokio::test]
    async fn chain_from_walks_successors_breadth_first() {
        let store = InMemoryTaskStore::new();
        let a = insert_committed(&store, draft("a")).await;
        let mut b = draft("b");
        b.run_after_task = Some(a.id);
        let b = insert_committed(&store, b).await;
        let mut c = draft("c");
        c.run_after_task = Some(b.id);
        let c = insert_committed(&store, c).await;
        let unrelated = insert_committed(&store, draft("x")).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.chain_from(a.id).await.unwrap(), vec![a.id, b.id, c.id]);
        assert_eq!(tx.chain_from(b.id).await.unwrap(), vec![b.id, c.id]);
        assert_eq!(tx.chain_from(unrelated.id).await.unwrap(), vec![unrelated.id]);
        assert!(tx.chain_from(TaskId::new(999)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chain_from_terminates_on_cycles() {
        let store = InMemoryTaskStore::new();
        let a = insert_committed(&store, draft("a")).await;
        let mut b = draft("b");
        b.run_after_task = Some(a.id);
        let b = insert_committed(&store, b).await;

        let mut tx = store.begin().await.unwrap();
        let mut a_row = tx.get_task(a.id).await.unwrap().unwrap();
        a_row.run_after_task = Some(b.id);
        tx.update_task(&a_row).await.unwrap();

        assert_eq!(tx.chain_from(a.id).await.unwrap(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn min_active_task_filters_by_model_and_state() {
        let store = InMemoryTaskStore::new();
        let res = ResourceRef::new("sale.import", 1);

        let mut t1 = draft("t1");
        t1.resource = Some(res.clone());
        t1.state = TaskState::Done;
        insert_committed(&store, t1).await;

        let mut t2 = draft("t2");
        t2.resource = Some(res.clone());
        t2.state = TaskState::Queued;
        let t2 = insert_committed(&store, t2).await;

        let mut t3 = draft("t3");
        t3.resource = Some(res);
        t3.state = TaskState::Running;
        insert_committed(&store, t3).await;

        let mut other = draft("other");
        other.state = TaskState::Queued;
        let other = insert_committed(&store, other).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.min_active_task("sale.import").await.unwrap(), Some(t2.id));
        assert_eq!(
            tx.min_active_task(crate::domain::TASK_MODEL).await.unwrap(),
            Some(other.id)
        );
        assert_eq!(tx.min_active_task("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stage_progress_keeps_status_when_none_given() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut tx = store.begin().await.unwrap();
        let root = tx.insert_stage(stage(task.id, None, "root")).await.unwrap();
        tx.set_stage_progress(root.id, 40.0, Some("loading"))
            .await
            .unwrap();
        tx.set_stage_progress(root.id, 60.0, None).await.unwrap();

        let row = tx.get_stage(root.id).await.unwrap().unwrap();
        assert_eq!(row.progress, 60.0);
        assert_eq!(row.status.as_deref(), Some("loading"));

        assert!(
            tx.set_stage_progress(StageId::new(77), 1.0, None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stage_parent_must_belong_to_same_task() {
        let store = InMemoryTaskStore::new();
        let t1 = insert_committed(&store, draft("t1")).await;
        let t2 = insert_committed(&store, draft("t2")).await;

        let mut tx = store.begin().await.unwrap();
        let root = tx.insert_stage(stage(t1.id, None, "root")).await.unwrap();
        let err = tx
            .insert_stage(stage(t2.id, Some(root.id), "foreign"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn replace_token_keeps_one_per_task() {
        let store = InMemoryTaskStore::new();
        let task = insert_committed(&store, draft("t")).await;

        let mut tx = store.begin().await.unwrap();
        for value in ["first", "second"] {
            tx.replace_token(AccessToken {
                task_id: task.id,
                token: value.into(),
                created_at: now(),
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.find_token("first").await.unwrap().is_none());
        assert_eq!(
            tx.token_for_task(task.id).await.unwrap().unwrap().token,
            "second"
        );
    }

    #[tokio::test]
    async fn due_schedules_are_ordered_by_priority() {
        let store = InMemoryTaskStore::new();
        let t1 = insert_committed(&store, draft("t1")).await;
        let t2 = insert_committed(&store, draft("t2")).await;

        let mut tx = store.begin().await.unwrap();
        for (task, active, offset) in [(t2.id, true, 0), (t1.id, true, -5), (t1.id, false, 0)] {
            tx.insert_schedule(ScheduleEntry {
                id: ScheduleId::new(0),
                task_id: task,
                action_id: ActionId::new(1),
                name: format!("Task {task}"),
                next_call: now() + chrono::Duration::seconds(offset),
                active,
                priority: 100_000 + task.get(),
                last_call: None,
            })
            .await
            .unwrap();
        }
        let future = tx
            .insert_schedule(ScheduleEntry {
                id: ScheduleId::new(0),
                task_id: t1.id,
                action_id: ActionId::new(1),
                name: "later".into(),
                next_call: now() + chrono::Duration::hours(1),
                active: true,
                priority: 0,
                last_call: None,
            })
            .await
            .unwrap();

        let due = tx.due_schedules(now()).await.unwrap();
        let tasks: Vec<TaskId> = due.iter().map(|e| e.task_id).collect();
        assert_eq!(tasks, vec![t1.id, t2.id]);
        assert!(due.iter().all(|e| e.id != future.id));
    }
}
