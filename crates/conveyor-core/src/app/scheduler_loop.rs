use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::engine::{ProcessOutcome, TaskEngine};
use crate::domain::{EngineError, TaskId};

/// In-process stand-in for the external scheduler.
///
/// Each tick takes the due, active scheduler entries, deactivates them
/// (fire-once) and calls `process` for their tasks, oldest first.
pub struct SchedulerLoop {
    engine: Arc<TaskEngine>,
}

impl SchedulerLoop {
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        Self { engine }
    }

    /// One scheduling pass. Returns what each fired task did.
    pub async fn tick(&self) -> Result<Vec<(TaskId, ProcessOutcome)>, EngineError> {
        let store = self.engine.store();
        let now = self.engine.clock().now();

        let mut tx = store.begin().await?;
        let due = tx.due_schedules(now).await?;
        for entry in &due {
            let mut fired = entry.clone();
            fired.active = false;
            fired.last_call = Some(now);
            tx.update_schedule(&fired).await?;
        }
        tx.commit().await?;

        let mut results = Vec::with_capacity(due.len());
        for entry in due {
            let outcome = self.engine.process(entry.task_id).await;
            tracing::debug!(task_id = %entry.task_id, outcome = ?outcome, "scheduler fired");
            results.push((entry.task_id, outcome));
        }
        Ok(results)
    }

    /// Run `tick` every `interval` until shutdown is requested.
    pub fn spawn(self, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        // 変更が入ったら次のループで判定
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(err) = self.tick().await {
                    tracing::warn!(error = %err, "scheduler tick failed");
                }
            }
        });

        SchedulerHandle { shutdown_tx, join }
    }
}

/// Scheduler handle.
/// - `request_shutdown()` で次の tick 以降を止める（実行中の process は最後まで走る）
/// - `shutdown_and_join()` で終了を待てる
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
