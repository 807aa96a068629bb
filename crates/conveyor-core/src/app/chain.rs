//! Dependency chain over `run_after_task` pointers.
//!
//! A chain starts at a task and continues through every task waiting on it.
//! It is a singly linked list by construction; append and insert refuse to
//! create a cycle.

use crate::app::engine::{TaskEngine, load_task};
use crate::domain::{EngineError, TaskId};
use crate::ports::StoreTx;

/// `id` followed by the tasks that (transitively) run after it.
pub async fn chain_list(tx: &mut dyn StoreTx, id: TaskId) -> Result<Vec<TaskId>, EngineError> {
    let chain = tx.chain_from(id).await?;
    if chain.is_empty() {
        return Err(EngineError::TaskNotFound(id));
    }
    Ok(chain)
}

/// Link `new` after the current tail of `task`'s chain.
///
/// Returns `false` when `new` is already in the chain.
pub async fn append_after_last(
    tx: &mut dyn StoreTx,
    task: TaskId,
    new: TaskId,
) -> Result<bool, EngineError> {
    let chain = chain_list(tx, task).await?;
    if chain.contains(&new) {
        return Ok(false);
    }
    let mut new_row = load_task(tx, new).await?;
    let Some(&tail) = chain.last() else {
        return Err(EngineError::TaskNotFound(task));
    };
    if tx.chain_from(new).await?.contains(&tail) {
        return Err(EngineError::ChainCycle(format!(
            "{tail} already runs after {new}"
        )));
    }

    new_row.run_after_task = Some(tail);
    tx.update_task(&new_row).await?;
    Ok(true)
}

/// Splice `new` directly after `task`; tasks that ran after `task` now run
/// after `new`.
///
/// Returns `false` when `new` is already in `task`'s chain.
pub async fn insert_after(
    tx: &mut dyn StoreTx,
    task: TaskId,
    new: TaskId,
) -> Result<bool, EngineError> {
    if task == new {
        return Err(EngineError::ChainCycle(format!(
            "{task} cannot run after itself"
        )));
    }
    load_task(tx, task).await?;
    let mut new_row = load_task(tx, new).await?;

    if tx.chain_from(task).await?.contains(&new) {
        return Ok(false);
    }
    if tx.chain_from(new).await?.contains(&task) {
        return Err(EngineError::ChainCycle(format!(
            "{task} already runs after {new}"
        )));
    }

    for mut next in tx.successors(task).await? {
        next.run_after_task = Some(new);
        tx.update_task(&next).await?;
    }
    new_row.run_after_task = Some(task);
    tx.update_task(&new_row).await?;
    Ok(true)
}

impl TaskEngine {
    pub async fn chain_list(&self, id: TaskId) -> Result<Vec<TaskId>, EngineError> {
        let mut tx = self.store().begin().await?;
        chain_list(tx.as_mut(), id).await
    }

    pub async fn append_after_last(&self, task: TaskId, new: TaskId) -> Result<bool, EngineError> {
        let mut tx = self.store().begin().await?;
        let linked = append_after_last(tx.as_mut(), task, new).await?;
        tx.commit().await?;
        Ok(linked)
    }

    pub async fn insert_after(&self, task: TaskId, new: TaskId) -> Result<bool, EngineError> {
        let mut tx = self.store().begin().await?;
        let linked = insert_after(tx.as_mut(), task, new).await?;
        tx.commit().await?;
        Ok(linked)
    }
}
