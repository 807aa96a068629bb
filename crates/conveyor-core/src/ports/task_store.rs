//! TaskStore port - タスク・ステージ・ログの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスク（状態、依存チェーン、実行メタデータ）
//! - ステージツリーとログストリーム
//! - access token
//! - スケジューラ行（ScheduleEntry / TriggerAction）
//!
//! すべての読み書きは明示的なトランザクション [`StoreTx`] を通します。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AccessToken, ActionId, LogRecord, ScheduleEntry, ScheduleId, StageId, StageRecord,
    StoreError, TaskId, TaskRecord, TaskState, TriggerAction,
};

/// TaskStore はトランザクションを開始する
///
/// # 設計原則
/// - 状態遷移とその副作用（ステージ削除・token 再発行・スケジューラ登録）は同一トランザクション内
/// - Running 遷移と終端遷移は別々にコミットする（実行中のクラッシュを観測可能にするため）
/// - 別スコープ（ingest など）のコミットを上書きしない：begin 以降に他スコープが
///   更新したタスク行を書き戻す commit は `StoreError::Conflict` で失敗し、何も反映しない
/// - 集合削除（`delete_stages_for_task` など）は commit 時点の行に効く
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// StoreTx は 1 トランザクション分のスコープ
///
/// `commit` / `rollback` は self を消費するので、終了後のスコープは使えない。
/// drop された場合は rollback 扱い。
#[async_trait]
pub trait StoreTx: Send {
    // ─── tasks ─────────────────────────────────────────────────────────────

    /// Insert a task; the store assigns the id.
    async fn insert_task(&mut self, task: TaskRecord) -> Result<TaskRecord, StoreError>;

    async fn get_task(&mut self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn update_task(&mut self, task: &TaskRecord) -> Result<(), StoreError>;

    /// Delete a task and everything it owns (stages, logs, token, scheduler
    /// entry, action). Tasks that ran after it are spliced onto its
    /// predecessor; child tasks lose their parent pointer.
    async fn delete_task(&mut self, id: TaskId) -> Result<bool, StoreError>;

    async fn list_tasks(&mut self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Smallest id of a Queued/Running task against the given resource model.
    async fn min_active_task(&mut self, model: &str) -> Result<Option<TaskId>, StoreError>;

    /// Tasks whose `run_after_task` points at `id`.
    async fn successors(&mut self, id: TaskId) -> Result<Vec<TaskRecord>, StoreError>;

    /// `id` followed by every task transitively waiting on it, breadth first.
    async fn chain_from(&mut self, id: TaskId) -> Result<Vec<TaskId>, StoreError>;

    async fn count_by_state(&mut self) -> Result<Vec<(TaskState, usize)>, StoreError>;

    // ─── stages ────────────────────────────────────────────────────────────

    async fn insert_stage(&mut self, stage: StageRecord) -> Result<StageRecord, StoreError>;

    async fn get_stage(&mut self, id: StageId) -> Result<Option<StageRecord>, StoreError>;

    /// Update own progress (already clamped) and, when given, the status label.
    async fn set_stage_progress(
        &mut self,
        id: StageId,
        progress: f64,
        status: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn stages_for_task(&mut self, task: TaskId) -> Result<Vec<StageRecord>, StoreError>;

    async fn delete_stages_for_task(&mut self, task: TaskId) -> Result<usize, StoreError>;

    // ─── log stream ────────────────────────────────────────────────────────

    async fn insert_log(&mut self, log: LogRecord) -> Result<LogRecord, StoreError>;

    async fn logs_for_task(&mut self, task: TaskId) -> Result<Vec<LogRecord>, StoreError>;

    async fn delete_logs_for_task(&mut self, task: TaskId) -> Result<usize, StoreError>;

    // ─── access tokens ─────────────────────────────────────────────────────

    /// Drop any previous token of the task and store this one.
    async fn replace_token(&mut self, token: AccessToken) -> Result<(), StoreError>;

    async fn token_for_task(&mut self, task: TaskId) -> Result<Option<AccessToken>, StoreError>;

    async fn find_token(&mut self, token: &str) -> Result<Option<AccessToken>, StoreError>;

    // ─── scheduler rows ────────────────────────────────────────────────────

    async fn insert_schedule(&mut self, entry: ScheduleEntry)
    -> Result<ScheduleEntry, StoreError>;

    async fn get_schedule(&mut self, id: ScheduleId) -> Result<Option<ScheduleEntry>, StoreError>;

    async fn update_schedule(&mut self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    async fn delete_schedule(&mut self, id: ScheduleId) -> Result<(), StoreError>;

    /// Active entries with `next_call <= now`, by priority then id.
    async fn due_schedules(&mut self, now: DateTime<Utc>)
    -> Result<Vec<ScheduleEntry>, StoreError>;

    async fn insert_action(&mut self, action: TriggerAction) -> Result<TriggerAction, StoreError>;

    async fn get_action(&mut self, id: ActionId) -> Result<Option<TriggerAction>, StoreError>;

    async fn delete_action(&mut self, id: ActionId) -> Result<(), StoreError>;

    // ─── scope ─────────────────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
