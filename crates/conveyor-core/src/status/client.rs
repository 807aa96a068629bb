//! StatusClient - the façade a running payload reports through.

use crate::domain::{Priority, ResourceRef, StageId, TaskId, clamp_progress};
use crate::status::StatusError;
use crate::status::transport::{DetachedTransport, StatusTransport, emit};
use crate::status::wire::{LogPush, ProgressPush, StagePush};

/// Status label of `done()` / `close()` updates.
pub const DONE_STATUS: &str = "Done";

/// First line logged on every run.
pub const STARTED_MESSAGE: &str = "Started";

/// A log line with its optional fields.
///
/// ```ignore
/// status
///     .log_with(LogLine::warning("Skipped partner").reference(partner_ref).code("P001"))
///     .await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub priority: Priority,
    pub message: String,
    pub reference: Option<ResourceRef>,
    pub progress: Option<f64>,
    pub code: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl LogLine {
    pub fn new(priority: Priority, message: impl Into<String>) -> Self {
        Self {
            priority,
            message: message.into(),
            reference: None,
            progress: None,
            code: None,
            data: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Priority::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Priority::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Priority::Error, message)
    }

    pub fn reference(mut self, reference: ResourceRef) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Also move the current stage's own progress.
    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Last pushed progress snapshot: `(stage, status, rounded value)`.
type ProgressSnapshot = (StageId, String, f64);

/// Reports stages, log lines and progress for one task run.
///
/// Nesting is an explicit stack of `(parent, current)` pairs: `stage` opens a
/// sibling under the current parent, `substage` opens a child of the current
/// stage, `done` completes the current stage and pops.
///
/// Not reusable across tasks and not shared across threads.
pub struct StatusClient<'a> {
    transport: Box<dyn StatusTransport + 'a>,
    task_id: TaskId,
    root: StageId,
    parent: StageId,
    current: StageId,
    stack: Vec<(StageId, StageId)>,
    last_progress: Option<ProgressSnapshot>,
    errors: u32,
    warnings: u32,
    loop_inc: f64,
    loop_progress: f64,
    mirror: bool,
    source: String,
}

impl<'a> StatusClient<'a> {
    /// Create the root stage (named after the task, `total` = stage hint)
    /// and log "Started".
    pub async fn open(
        mut transport: Box<dyn StatusTransport + 'a>,
        task_id: TaskId,
        task_name: &str,
        stages: u32,
        mirror: bool,
    ) -> Result<Self, StatusError> {
        let root = transport
            .create_stage(StagePush {
                parent_id: None,
                name: task_name.to_string(),
                total: Some(stages.max(1)),
            })
            .await?;

        let mut client = Self {
            transport,
            task_id,
            root,
            parent: root,
            current: root,
            stack: Vec::new(),
            last_progress: None,
            errors: 0,
            warnings: 0,
            loop_inc: 0.0,
            loop_progress: 0.0,
            mirror,
            source: format!("task {task_id}"),
        };
        if mirror {
            tracing::info!(task_id = %task_id, "= {task_name}");
        }
        client.info(STARTED_MESSAGE).await?;
        Ok(client)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn root_stage(&self) -> StageId {
        self.root
    }

    pub fn current_stage(&self) -> StageId {
        self.current
    }

    pub fn parent_stage(&self) -> StageId {
        self.parent
    }

    /// Number of stages opened and not yet done.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Error-level (and above) lines logged so far.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// New stage as a sibling at the current nesting level.
    pub async fn stage(&mut self, title: &str, total: Option<u32>) -> Result<StageId, StatusError> {
        let id = self.create(self.parent, title, total).await?;
        self.stack.push((self.parent, self.current));
        self.current = id;
        Ok(id)
    }

    /// New stage as a child of the current stage.
    pub async fn substage(
        &mut self,
        title: &str,
        total: Option<u32>,
    ) -> Result<StageId, StatusError> {
        let id = self.create(self.current, title, total).await?;
        self.stack.push((self.parent, self.current));
        self.parent = self.current;
        self.current = id;
        Ok(id)
    }

    async fn create(
        &mut self,
        parent: StageId,
        title: &str,
        total: Option<u32>,
    ) -> Result<StageId, StatusError> {
        if self.mirror {
            tracing::info!(task_id = %self.task_id, "= {title}");
        }
        self.transport
            .create_stage(StagePush {
                parent_id: Some(parent),
                name: title.to_string(),
                total: total.filter(|t| *t > 0),
            })
            .await
    }

    pub async fn log(&mut self, priority: Priority, message: impl Into<String>) -> Result<(), StatusError> {
        self.log_with(LogLine::new(priority, message)).await
    }

    pub async fn log_with(&mut self, line: LogLine) -> Result<(), StatusError> {
        if line.priority.is_error() {
            self.errors += 1;
        } else if line.priority == Priority::Warning {
            self.warnings += 1;
        }
        if self.mirror {
            emit(&self.source, line.priority, &line.message);
        }
        self.transport
            .push_log(LogPush {
                stage_id: self.current,
                priority: line.priority,
                message: line.message,
                reference: line.reference,
                code: line.code,
                data: line.data,
                progress: line.progress,
            })
            .await?;
        Ok(())
    }

    pub async fn debug(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Debug, message).await
    }

    pub async fn info(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Info, message).await
    }

    pub async fn notice(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Notice, message).await
    }

    pub async fn warning(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Warning, message).await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Error, message).await
    }

    pub async fn alert(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Alert, message).await
    }

    pub async fn emergency(&mut self, message: impl Into<String>) -> Result<(), StatusError> {
        self.log(Priority::Emergency, message).await
    }

    /// Report progress of the current stage. Repeating the last
    /// `(stage, status, value)` is not pushed again.
    pub async fn progress(&mut self, status: &str, value: f64) -> Result<(), StatusError> {
        let value = clamp_progress(value).round_ties_even();
        let snapshot = (self.current, status.to_string(), value);
        if self.last_progress.as_ref() == Some(&snapshot) {
            return Ok(());
        }
        self.transport
            .push_progress(ProgressPush {
                stage_id: self.current,
                status: Some(status.to_string()),
                progress: value,
            })
            .await?;
        self.last_progress = Some(snapshot);
        Ok(())
    }

    /// Prepare `count` equal steps; reports 0 (or 100 for an empty loop).
    pub async fn loop_init(&mut self, count: usize, status: &str) -> Result<(), StatusError> {
        if count == 0 {
            self.loop_inc = 0.0;
            self.loop_progress = 100.0;
        } else {
            self.loop_inc = 100.0 / count as f64;
            self.loop_progress = 0.0;
        }
        self.progress(status, self.loop_progress).await
    }

    /// Advance the loop by `step` steps.
    pub async fn loop_next(&mut self, status: &str, step: usize) -> Result<(), StatusError> {
        self.loop_progress += self.loop_inc * step as f64;
        self.progress(status, self.loop_progress).await
    }

    /// Complete the current stage and return to the enclosing one.
    pub async fn done(&mut self) -> Result<(), StatusError> {
        self.progress(DONE_STATUS, 100.0).await?;
        if let Some((parent, current)) = self.stack.pop() {
            self.parent = parent;
            self.current = current;
        }
        Ok(())
    }

    /// Final update: root stage at 100, whatever the stack holds.
    pub async fn close(mut self) -> Result<(), StatusError> {
        self.transport
            .push_progress(ProgressPush {
                stage_id: self.root,
                status: Some(DONE_STATUS.to_string()),
                progress: 100.0,
            })
            .await
    }
}

impl StatusClient<'static> {
    /// Client that only writes to `tracing`, for exercising payloads
    /// without a store.
    pub async fn detached(name: &str) -> Result<Self, StatusError> {
        let transport = Box::new(DetachedTransport::new(name));
        Self::open(transport, TaskId::new(0), name, 1, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogId;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Stage(Option<i64>, String, Option<u32>),
        Log(i64, Priority, String),
        Progress(i64, Option<String>, f64),
    }

    /// Records pushes; stage ids count up from 1.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_progress: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn progress_calls(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Progress(..)))
                .collect()
        }

        fn stage_count(&self) -> i64 {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Stage(..)))
                .count() as i64
        }
    }

    #[async_trait]
    impl StatusTransport for Recorder {
        async fn create_stage(&mut self, push: StagePush) -> Result<StageId, StatusError> {
            let id = self.stage_count() + 1;
            self.calls.lock().unwrap().push(Call::Stage(
                push.parent_id.map(|p| p.get()),
                push.name,
                push.total,
            ));
            Ok(StageId::new(id))
        }

        async fn push_log(&mut self, push: LogPush) -> Result<LogId, StatusError> {
            self.calls.lock().unwrap().push(Call::Log(
                push.stage_id.get(),
                push.priority,
                push.message,
            ));
            Ok(LogId::new(1))
        }

        async fn push_progress(&mut self, push: ProgressPush) -> Result<(), StatusError> {
            if self.fail_progress {
                return Err(StatusError::Status {
                    url: "http://collector/progress".into(),
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            self.calls.lock().unwrap().push(Call::Progress(
                push.stage_id.get(),
                push.status,
                push.progress,
            ));
            Ok(())
        }
    }

    async fn open(recorder: &Recorder, stages: u32) -> StatusClient<'static> {
        StatusClient::open(Box::new(recorder.clone()), TaskId::new(5), "Import", stages, false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_creates_root_and_logs_started() {
        let rec = Recorder::default();
        let client = open(&rec, 3).await;

        assert_eq!(client.root_stage(), StageId::new(1));
        assert_eq!(client.current_stage(), StageId::new(1));
        assert_eq!(
            rec.calls(),
            vec![
                Call::Stage(None, "Import".into(), Some(3)),
                Call::Log(1, Priority::Info, "Started".into()),
            ]
        );
    }

    #[tokio::test]
    async fn stage_opens_sibling_and_substage_opens_child() {
        let rec = Recorder::default();
        let mut client = open(&rec, 2).await;

        let s1 = client.stage("Stage 1", Some(2)).await.unwrap();
        assert_eq!(client.parent_stage(), client.root_stage());
        assert_eq!(client.current_stage(), s1);

        let sub = client.substage("Stage 1.1", None).await.unwrap();
        assert_eq!(client.parent_stage(), s1);
        assert_eq!(client.current_stage(), sub);
        assert_eq!(client.depth(), 2);

        // sibling of 1.1
        let sub2 = client.stage("Stage 1.2", None).await.unwrap();
        assert_eq!(client.parent_stage(), s1);

        client.done().await.unwrap();
        assert_eq!(client.current_stage(), sub);
        client.done().await.unwrap();
        assert_eq!(client.current_stage(), s1);
        client.done().await.unwrap();
        assert_eq!(client.current_stage(), client.root_stage());
        assert_eq!(client.depth(), 0);

        // done at the root keeps the root current
        client.done().await.unwrap();
        assert_eq!(client.current_stage(), client.root_stage());

        let stages: Vec<Call> = rec
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Stage(..)))
            .collect();
        assert_eq!(
            stages,
            vec![
                Call::Stage(None, "Import".into(), Some(2)),
                Call::Stage(Some(1), "Stage 1".into(), Some(2)),
                Call::Stage(Some(s1.get()), "Stage 1.1".into(), None),
                Call::Stage(Some(s1.get()), "Stage 1.2".into(), None),
            ]
        );
        assert_eq!(sub2, StageId::new(4));
    }

    #[tokio::test]
    async fn identical_progress_is_pushed_once() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        client.progress("Loading", 50.0).await.unwrap();
        client.progress("Loading", 50.0).await.unwrap();
        client.progress("Loading", 50.2).await.unwrap(); // rounds to 50
        client.progress("Parsing", 50.0).await.unwrap();
        client.progress("Parsing", 60.0).await.unwrap();
        client.progress("Parsing", 60.5).await.unwrap(); // ties to even, 60

        assert_eq!(
            rec.progress_calls(),
            vec![
                Call::Progress(1, Some("Loading".into()), 50.0),
                Call::Progress(1, Some("Parsing".into()), 50.0),
                Call::Progress(1, Some("Parsing".into()), 60.0),
            ]
        );
    }

    #[tokio::test]
    async fn same_progress_on_another_stage_is_pushed() {
        let rec = Recorder::default();
        let mut client = open(&rec, 2).await;

        client.stage("A", None).await.unwrap();
        client.done().await.unwrap();
        client.stage("B", None).await.unwrap();
        client.done().await.unwrap();

        assert_eq!(
            rec.progress_calls(),
            vec![
                Call::Progress(2, Some("Done".into()), 100.0),
                Call::Progress(3, Some("Done".into()), 100.0),
            ]
        );
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        client.progress("over", 140.0).await.unwrap();
        client.progress("under", -3.0).await.unwrap();

        assert_eq!(
            rec.progress_calls(),
            vec![
                Call::Progress(1, Some("over".into()), 100.0),
                Call::Progress(1, Some("under".into()), 0.0),
            ]
        );
    }

    #[tokio::test]
    async fn loop_helpers_report_proportional_progress() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        client.loop_init(4, "Rows").await.unwrap();
        client.loop_next("Rows", 1).await.unwrap();
        client.loop_next("Rows", 2).await.unwrap();
        client.loop_next("Rows", 1).await.unwrap();

        let values: Vec<f64> = rec
            .progress_calls()
            .into_iter()
            .map(|c| match c {
                Call::Progress(_, _, v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![0.0, 25.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn empty_loop_is_complete() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        client.loop_init(0, "Nothing").await.unwrap();
        client.loop_next("Nothing", 1).await.unwrap();

        assert_eq!(
            rec.progress_calls(),
            vec![Call::Progress(1, Some("Nothing".into()), 100.0)]
        );
    }

    #[tokio::test]
    async fn counters_track_warnings_and_errors() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        client.warning("w").await.unwrap();
        client.error("e").await.unwrap();
        client.alert("a").await.unwrap();
        client.emergency("x").await.unwrap();
        client.notice("n").await.unwrap();
        client.debug("d").await.unwrap();

        assert_eq!(client.warnings(), 1);
        assert_eq!(client.errors(), 3);
    }

    #[tokio::test]
    async fn log_lines_go_to_the_current_stage() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        let s = client.stage("Work", None).await.unwrap();
        client
            .log_with(LogLine::info("row").code("R1").progress(10.0))
            .await
            .unwrap();

        assert_eq!(
            rec.calls().last(),
            Some(&Call::Log(s.get(), Priority::Info, "row".into()))
        );
    }

    #[tokio::test]
    async fn close_always_pushes_root_completion() {
        let rec = Recorder::default();
        let mut client = open(&rec, 1).await;

        client.progress(DONE_STATUS, 100.0).await.unwrap();
        client.stage("dangling", None).await.unwrap();
        client.close().await.unwrap();

        assert_eq!(
            rec.progress_calls(),
            vec![
                Call::Progress(1, Some("Done".into()), 100.0),
                Call::Progress(1, Some("Done".into()), 100.0),
            ]
        );
    }

    #[tokio::test]
    async fn transport_failures_propagate_and_allow_retry() {
        let rec = Recorder {
            fail_progress: true,
            ..Recorder::default()
        };
        let mut client = open(&rec, 1).await;

        let err = client.progress("x", 10.0).await.unwrap_err();
        assert!(matches!(err, StatusError::Status { status: 502, .. }));
        // not recorded as pushed
        assert!(client.last_progress.is_none());
    }

    #[tokio::test]
    async fn detached_client_needs_no_store() {
        let mut client = StatusClient::detached("scratch").await.unwrap();
        client.stage("A", None).await.unwrap();
        client.error("oops").await.unwrap();
        client.done().await.unwrap();
        assert_eq!(client.errors(), 1);
        client.close().await.unwrap();
    }
}
