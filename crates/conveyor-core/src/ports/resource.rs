//! Resource port - タスクが操作する業務オブジェクト
//!
//! - **Runnable**: payload hook（`run(status)`）
//! - **Configurable**: 任意の run options（capability として `Runnable::configurable` で検出）
//! - **ResourceProvider**: model 名ごとに id から Runnable / 表示名を解決

use async_trait::async_trait;
use std::sync::Arc;

use crate::status::StatusClient;

/// Engine-facing options a resource type may customize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Stage-count hint, used as the root stage's `total`.
    pub stages: u32,

    /// At most one Queued/Running task per resource model.
    pub singleton: bool,

    /// Fail the run when any error-level line was logged. Error-level
    /// means `Priority::Error` and above, so Alert and Emergency lines count
    /// too.
    pub fail_on_errors: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stages: 1,
            singleton: false,
            fail_on_errors: false,
        }
    }
}

/// Runnable は payload hook
///
/// エラーは engine が捕捉して task の `error` に記録する。
/// panic も捕捉される（Unexpected として扱う）。
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, status: &mut StatusClient<'_>) -> anyhow::Result<()>;

    /// Options capability. `None` means defaults.
    fn configurable(&self) -> Option<&dyn Configurable> {
        None
    }
}

pub trait Configurable: Send + Sync {
    fn run_options(&self) -> RunOptions;
}

/// ResourceProvider は 1 つの model 名を担当する
pub trait ResourceProvider: Send + Sync {
    fn model(&self) -> &str;

    /// Payload for a record of this model, `None` when it does not exist.
    fn load(&self, id: i64) -> Option<Arc<dyn Runnable>>;

    /// Human-readable label for log reference expansion.
    fn display_name(&self, _id: i64) -> Option<String> {
        None
    }
}

/// Provider that serves one shared payload for every id of a model.
pub struct SharedProvider {
    model: String,
    runnable: Arc<dyn Runnable>,
}

impl SharedProvider {
    pub fn new(model: impl Into<String>, runnable: Arc<dyn Runnable>) -> Self {
        Self {
            model: model.into(),
            runnable,
        }
    }
}

impl ResourceProvider for SharedProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn load(&self, _id: i64) -> Option<Arc<dyn Runnable>> {
        Some(Arc::clone(&self.runnable))
    }
}
