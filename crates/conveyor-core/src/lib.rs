//! conveyor-core
//!
//! Task automation engine: task lifecycle, dependency chains, stage
//! progress trees and the status reporting client.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, stage, log, schedule, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, TokenGenerator, Runnable / ResourceProvider）
//! - **impls**: 実装（InMemoryTaskStore）
//! - **app**: アプリケーションロジック（engine, chain, builder, scheduler_loop, status views）
//! - **status**: StatusClient とトランスポート（local / remote / detached）
//! - **ingest**: remote モードの受け口（axum router）
//! - **config** / **logging**: 設定ファイルと tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ingest;
pub mod logging;
pub mod ports;
pub mod status;

pub use app::{EngineBuilder, ProcessOutcome, SchedulerLoop, TaskEngine};
pub use config::ConveyorConfig;
pub use status::StatusClient;
