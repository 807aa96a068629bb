//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部コラボレータ（トランザクショナルストア、業務オブジェクト、
//! 時計、乱数）へのインターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod resource;
pub mod task_store;
pub mod token_generator;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::resource::{Configurable, ResourceProvider, RunOptions, Runnable, SharedProvider};
pub use self::task_store::{StoreTx, TaskStore};
pub use self::token_generator::{RandomTokenGenerator, TokenGenerator};
