use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::time::{Duration, sleep};

use conveyor_core::config::{ConveyorConfig, ReportingMode};
use conveyor_core::domain::{NewTask, Principal, TASK_MODEL, TaskState, UserId};
use conveyor_core::ingest::{self, IngestService};
use conveyor_core::logging;
use conveyor_core::ports::{Configurable, RunOptions, Runnable, SharedProvider};
use conveyor_core::status::StatusClient;
use conveyor_core::{EngineBuilder, SchedulerLoop, TaskEngine};

#[derive(Parser, Debug)]
#[command(name = "conveyor", about = "Task automation engine")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a demo task through the scheduler and print its stage tree.
    Demo(DemoArgs),

    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct DemoArgs {
    /// Reporting transport; defaults to the configured one.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    #[arg(long, default_value_t = 2)]
    stages: u32,

    /// Loop steps per stage.
    #[arg(long, default_value_t = 5)]
    steps: usize,

    /// Print the final task row and counts as JSON.
    #[arg(long)]
    json: bool,

    /// Give up waiting for the task after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    Local,
    Remote,
}

impl From<Mode> for ReportingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => ReportingMode::Local,
            Mode::Remote => ReportingMode::Remote,
        }
    }
}

/// Demo payload: `stages` stages of `steps` loop steps each.
struct DemoImport {
    stages: u32,
    steps: usize,
}

#[async_trait]
impl Runnable for DemoImport {
    async fn run(&self, status: &mut StatusClient<'_>) -> anyhow::Result<()> {
        for n in 1..=self.stages {
            status.stage(&format!("Stage {n}"), Some(1)).await?;
            status.loop_init(self.steps, "Importing").await?;
            for step in 1..=self.steps {
                if step % 4 == 0 {
                    status.warning(format!("row {step} skipped")).await?;
                } else {
                    status.debug(format!("row {step} imported")).await?;
                }
                sleep(Duration::from_millis(20)).await;
                status.loop_next("Importing", 1).await?;
            }
            status.done().await?;
        }
        Ok(())
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

impl Configurable for DemoImport {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            stages: self.stages,
            ..RunOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::Demo(demo_args) => demo(demo_args).await,
        Commands::Config { config } => {
            let cfg = ConveyorConfig::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

async fn demo(args: DemoArgs) -> anyhow::Result<()> {
    let mut cfg = ConveyorConfig::load(args.config.as_deref())?;
    logging::init(&cfg.logging);
    if let Some(mode) = args.mode {
        cfg.engine.reporting = mode.into();
    }

    // remote モードでは先に受け口を立てる（port = 0 なら一時ポート）
    let listener = match cfg.engine.reporting {
        ReportingMode::Local => None,
        ReportingMode::Remote => {
            let listener = tokio::net::TcpListener::bind((cfg.ingest.host.as_str(), cfg.ingest.port))
                .await
                .context("binding the ingestion endpoint")?;
            let addr = listener.local_addr()?;
            let prefix = cfg.ingest.path_prefix.trim_end_matches('/');
            cfg.engine.base_url = Some(format!("http://{addr}{prefix}"));
            Some(listener)
        }
    };

    let engine = Arc::new(
        EngineBuilder::new()
            .register(SharedProvider::new(
                TASK_MODEL,
                Arc::new(DemoImport {
                    stages: args.stages,
                    steps: args.steps,
                }),
            ))?
            .expect_models(&[TASK_MODEL])
            .config(cfg.engine.clone())
            .build()?,
    );

    if let Some(listener) = listener {
        let app = ingest::mount(&cfg.ingest.path_prefix, IngestService::for_engine(&engine));
        tracing::info!(base_url = ?cfg.engine.base_url, "ingestion endpoint listening");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "ingestion endpoint stopped");
            }
        });
    }

    let owner = Principal::user(UserId::new(2));
    let task = engine.create_task(NewTask::new("Demo import"), &owner).await?;
    engine.enqueue(task.id, &owner).await?;
    println!("enqueued task: {}", task.id);

    let scheduler = SchedulerLoop::new(Arc::clone(&engine)).spawn(cfg.scheduler.poll_interval());
    let waited = wait_terminal(&engine, task.id, Duration::from_secs(args.timeout_secs)).await;
    scheduler.shutdown_and_join().await;
    let state = waited?;

    let summary = engine.summary(task.id).await?;
    if args.json {
        let counts = engine.counts_by_state().await?;
        let out = serde_json::json!({ "task": summary.task, "counts": counts });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "final status: state={state} progress={} logs={} warnings={} errors={}",
        summary.progress, summary.total_logs, summary.total_warnings, summary.total_errors
    );
    if let Some(error) = &summary.task.error {
        println!("error: {error}");
    }
    for (depth, stage) in summary.stages.walk() {
        println!(
            "{}{} [{}%] {}",
            "  ".repeat(depth),
            stage.name,
            summary.stages.compute_progress(stage.id),
            stage.status.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// 完了をポーリングで待つ（Done / Failed / Canceled）。`limit` を過ぎたらエラー
async fn wait_terminal(
    engine: &TaskEngine,
    id: conveyor_core::domain::TaskId,
    limit: Duration,
) -> anyhow::Result<TaskState> {
    let poll = async {
        loop {
            let task = engine.task(id).await?;
            if task.state.is_terminal() {
                return Ok::<_, anyhow::Error>(task.state);
            }
            sleep(Duration::from_millis(50)).await;
        }
    };
    match tokio::time::timeout(limit, poll).await {
        Ok(state) => state,
        Err(_) => anyhow::bail!("task {id} not finished after {limit:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiting_gives_up_after_the_limit() {
        let engine = EngineBuilder::new().build().unwrap();
        let owner = Principal::user(UserId::new(2));
        // never enqueued, so never terminal
        let task = engine.create_task(NewTask::new("Idle"), &owner).await.unwrap();

        let err = wait_terminal(&engine, task.id, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not finished"));
    }

    #[tokio::test]
    async fn waiting_returns_the_terminal_state() {
        let engine = EngineBuilder::new().build().unwrap();
        let owner = Principal::user(UserId::new(2));
        let task = engine.create_task(NewTask::new("Quick"), &owner).await.unwrap();
        engine.enqueue(task.id, &owner).await.unwrap();
        engine.cancel(task.id, &owner).await.unwrap();

        let state = wait_terminal(&engine, task.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, TaskState::Canceled);
    }
}
