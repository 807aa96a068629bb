//! App - ユースケース層
//!
//! - **TaskEngine**: ライフサイクル（enqueue / cancel / process / delete）と読み取り
//! - **chain**: 依存チェーン
//! - **EngineBuilder**: ワイヤリングと起動時検証
//! - **SchedulerLoop**: 外部スケジューラの代替（テスト・デモ用）

pub mod builder;
pub mod chain;
pub mod engine;
pub mod registry;
pub mod scheduler_loop;
pub mod status;

pub use builder::{BuildError, EngineBuilder};
pub use engine::{FINISHED_WITH_ERRORS, ProcessOutcome, TaskEngine};
pub use registry::{RegistryError, ResourceRegistry};
pub use scheduler_loop::{SchedulerHandle, SchedulerLoop};
pub use status::{TaskCounts, TaskSummary};
