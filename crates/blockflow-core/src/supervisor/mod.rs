//! Task supervisor: submission, background execution, result streaming and status.
//!
//! `submit` validates the graph, registers it in the [`TaskStore`] and runs its [`WorkFlow`] as a
//! detached tokio task. Iteration deltas, then exactly one `End` or `Error` event, are pushed into
//! the task's queue, which callers drain through [`TaskStream`]. When the run ends the supervisor
//! hands the task to [`TaskStore::cleanup_task`].

mod status;
mod stream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, ResourceError, Stage};
use crate::executor::EdgeRegistry;
use crate::model::{Graph, TaskId};
use crate::parser::check_edge;
use crate::runtime::{Delta, SchedulerOptions, WorkFlow};
use crate::store::{AbortHandle, TaskStatus, TaskStore};

pub use status::{SubmitResponse, TaskStatusSnapshot};
pub use stream::{StreamEvent, TaskStream};

/// Identity attached to a submission. Only `user_id` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            extra: Map::new(),
        }
    }
}

/// Supervisor-side record of one task.
pub struct TaskState {
    pub status: TaskStatus,
    pub user_info: UserInfo,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    progress: f64,
    finished: Option<Instant>,
    queue: stream::SharedQueue,
}

impl TaskState {
    fn new(user_info: UserInfo, queue: stream::SharedQueue) -> Self {
        Self {
            status: TaskStatus::Pending,
            user_info,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
            progress: 0.0,
            finished: None,
            queue,
        }
    }

    fn snapshot(&self, task_id: TaskId) -> TaskStatusSnapshot {
        TaskStatusSnapshot {
            task_id,
            status: self.status,
            progress_percentage: self.progress,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Raise the progress high-water mark.
    fn observe_progress(&mut self, progress: f64) {
        if progress > self.progress {
            self.progress = progress;
        }
    }
}

/// Owns the task lifecycle. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Supervisor {
    store: Arc<TaskStore>,
    registry: Arc<EdgeRegistry>,
    pool: Arc<Semaphore>,
    tasks: Arc<DashMap<TaskId, TaskState>>,
    config: EngineConfig,
}

impl Supervisor {
    pub fn new(registry: Arc<EdgeRegistry>, config: EngineConfig) -> Self {
        let config = config.normalized();
        Self {
            store: Arc::new(TaskStore::new(config.cleanup_grace())),
            pool: Arc::new(Semaphore::new(config.worker_pool_size)),
            registry,
            tasks: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EdgeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Checks that can be made before anything runs.
    pub fn validate(&self, graph: &Graph) -> Result<(), EngineError> {
        let submit = |e| EngineError::config(Stage::Submit, e);
        graph.check_version().map_err(submit)?;
        graph.check_references().map_err(submit)?;
        for (edge_id, edge) in &graph.edges {
            if !self.registry.contains(edge.kind) {
                return Err(submit(ConfigError::UnregisteredKind(edge.kind)));
            }
            check_edge(edge_id, edge).map_err(submit)?;
        }
        Ok(())
    }

    /// Parse a JSON submission and [`submit`](Self::submit) it.
    pub fn submit_json(&self, payload: Value, user_info: UserInfo) -> Result<SubmitResponse, EngineError> {
        let graph = Graph::from_json(payload).map_err(|e| EngineError::config(Stage::Submit, e))?;
        let task_id = self.submit(graph, user_info)?;
        Ok(SubmitResponse { task_id })
    }

    /// Validate `graph`, register it and start running it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, graph: Graph, user_info: UserInfo) -> Result<TaskId, EngineError> {
        self.validate(&graph)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            EngineError::resource(Stage::Submit, ResourceError::WorkerPool(e.to_string()))
        })?;

        let task_id = TaskId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks
            .insert(task_id, TaskState::new(user_info, Arc::new(Mutex::new(rx))));
        let edges = graph.edges.len();
        self.store.insert_task(task_id, graph);
        let (abort, signal) = AbortHandle::pair();
        self.store.register_abort(task_id, abort);

        let flow = WorkFlow::new(
            task_id,
            self.store.clone(),
            self.registry.clone(),
            self.pool.clone(),
        )
        .with_options(self.scheduler_options())
        .with_abort(signal);
        let run = TaskRun {
            task_id,
            store: self.store.clone(),
            tasks: self.tasks.clone(),
            events: tx,
        };
        runtime.spawn(
            run.drive(flow)
                .instrument(info_span!("task", task_id = %task_id)),
        );
        info!(%task_id, edges, "task submitted");
        Ok(task_id)
    }

    fn scheduler_options(&self) -> SchedulerOptions {
        self.config.scheduler_options()
    }

    /// Open the result stream of a task owned by `requester`.
    pub fn stream(&self, task_id: TaskId, requester: &UserInfo) -> Result<TaskStream, EngineError> {
        let state = self.tasks.get(&task_id).ok_or_else(|| {
            EngineError::resource(Stage::Stream, ResourceError::TaskNotFound(task_id))
        })?;
        if state.user_info.user_id != requester.user_id {
            warn!(%task_id, requester = %requester.user_id, "stream access denied");
            return Err(EngineError::resource(
                Stage::Stream,
                ResourceError::Unauthorized {
                    task_id,
                    user_id: requester.user_id.clone(),
                },
            ));
        }
        Ok(TaskStream::new(
            task_id,
            state.queue.clone(),
            self.tasks.clone(),
            self.config.stream_poll(),
        ))
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskStatusSnapshot> {
        let current = self
            .store
            .update_task(task_id, |task| task.state.progress_percentage())
            .ok();
        let mut state = self.tasks.get_mut(&task_id)?;
        if let Some(progress) = current {
            state.observe_progress(progress);
        }
        Some(state.snapshot(task_id))
    }

    /// Drop state of tasks that finished more than `older_than` ago.
    pub fn sweep(&self, older_than: Duration) -> usize {
        self.sweep_at(Instant::now(), older_than)
    }

    pub fn sweep_at(&self, now: Instant, older_than: Duration) -> usize {
        sweep_finished(&self.tasks, now, older_than)
    }

    /// Periodically sweep both the task store and the supervisor state, every
    /// `sweep_interval`. Stops once every clone of this supervisor is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.spawn_sweeper_every(self.config.sweep_interval(), self.config.state_retention())
    }

    fn spawn_sweeper_every(&self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(&self.store);
        let tasks = Arc::downgrade(&self.tasks);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(store), Some(tasks)) = (store.upgrade(), tasks.upgrade()) else {
                    break;
                };
                let now = Instant::now();
                store.sweep_expired(now);
                sweep_finished(&tasks, now, retention);
            }
        })
    }
}

fn sweep_finished(tasks: &DashMap<TaskId, TaskState>, now: Instant, older_than: Duration) -> usize {
    let before = tasks.len();
    tasks.retain(|_, state| {
        !state
            .finished
            .is_some_and(|at| now.saturating_duration_since(at) >= older_than)
    });
    let removed = before.saturating_sub(tasks.len());
    if removed > 0 {
        info!(removed, "swept finished task state");
    }
    removed
}

/// Background half of one submission.
struct TaskRun {
    task_id: TaskId,
    store: Arc<TaskStore>,
    tasks: Arc<DashMap<TaskId, TaskState>>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl TaskRun {
    async fn drive(self, flow: WorkFlow) {
        let task_id = self.task_id;
        if let Some(mut state) = self.tasks.get_mut(&task_id) {
            state.status = TaskStatus::Running;
            state.started_at = Some(Utc::now());
        }
        if let Err(err) = self.store.set_status(task_id, TaskStatus::Running) {
            warn!(error = %err, "could not mark task running");
        }

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<Delta>();
        let forward = {
            let store = self.store.clone();
            let tasks = self.tasks.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                while let Some(delta) = delta_rx.recv().await {
                    if let Ok(progress) =
                        store.update_task(task_id, |task| task.state.progress_percentage())
                        && let Some(mut state) = tasks.get_mut(&task_id)
                    {
                        state.observe_progress(progress);
                    }
                    if events.send(StreamEvent::Data(delta)).is_err() {
                        break;
                    }
                }
            })
        };

        let result = flow.run(&delta_tx).await;
        drop(delta_tx);
        if let Err(err) = forward.await {
            warn!(error = %err, "delta forwarder stopped abnormally");
        }

        let progress = self
            .store
            .update_task(task_id, |task| task.state.progress_percentage())
            .ok();
        let status = match &result {
            Ok(_) => TaskStatus::Completed,
            Err(_) => TaskStatus::Failed,
        };
        if let Err(err) = self.store.set_status(task_id, status) {
            warn!(error = %err, "could not record terminal status");
        }

        // Status and terminal event change together so a polling stream never sees a
        // terminal status with the event still missing.
        if let Some(mut state) = self.tasks.get_mut(&task_id) {
            state.status = status;
            state.finished_at = Some(Utc::now());
            state.finished = Some(Instant::now());
            if let Some(progress) = progress {
                state.observe_progress(progress);
            }
            let event = match &result {
                Ok(summary) => {
                    info!(iterations = summary.iterations, yields = summary.yields, "task completed");
                    StreamEvent::End {
                        total_yields: summary.yields,
                        task_status: state.snapshot(task_id),
                    }
                }
                Err(err) => {
                    error!(code = err.code(), stage = %err.stage(), error = %err, "task failed");
                    state.error_message = Some(err.to_string());
                    StreamEvent::Error {
                        message: err.to_string(),
                        code: err.code().to_string(),
                    }
                }
            };
            if self.events.send(event).is_err() {
                info!("no stream consumer left for terminal event");
            }
        }

        if let Err(err) = self.store.cleanup_task(task_id) {
            warn!(error = %err, "task cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EdgeError;
    use crate::executor::{EdgeExecutor, EdgeOutput};
    use crate::model::{Block, BlockKind, Edge, EdgeKind};
    use crate::parser::ResolvedEdge;
    use crate::template::substitute;
    use futures::StreamExt as _;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct Render;

    impl EdgeExecutor for Render {
        fn kind(&self) -> EdgeKind {
            EdgeKind::Llm
        }

        fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
            let template = edge.content().and_then(Value::as_str).unwrap_or_default();
            Ok(EdgeOutput::Content(json!(substitute(template, &edge.plugins))))
        }
    }

    struct Slow;

    impl EdgeExecutor for Slow {
        fn kind(&self) -> EdgeKind {
            EdgeKind::Code
        }

        fn execute(&self, _edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
            std::thread::sleep(Duration::from_millis(50));
            Err(EdgeError::provider("timed out"))
        }
    }

    fn supervisor() -> Supervisor {
        let registry = EdgeRegistry::builder()
            .register(Arc::new(Render))
            .register(Arc::new(Slow))
            .build()
            .unwrap();
        Supervisor::new(
            Arc::new(registry),
            EngineConfig {
                stream_poll_ms: 20,
                ..EngineConfig::default()
            },
        )
    }

    fn render(input: &str, output: &str, template: &str) -> Edge {
        Edge::new(EdgeKind::Llm)
            .input(input)
            .output(output)
            .with_field("content", json!(template))
    }

    fn chain() -> Graph {
        Graph::builder()
            .block("a", Block::text("hi"))
            .block("b", Block::empty(BlockKind::Text))
            .block("c", Block::empty(BlockKind::Text))
            .block("stuck_in", Block::empty(BlockKind::Text))
            .block("stuck_out", Block::empty(BlockKind::Text))
            .edge("e1", render("a", "b", "{{a}} there"))
            .edge("e2", render("b", "c", "{{b}}!"))
            .edge("never", render("stuck_in", "stuck_out", "x"))
            .build()
    }

    #[tokio::test]
    async fn streams_deltas_then_end() {
        let supervisor = supervisor();
        let owner = UserInfo::new("u1");
        let task_id = supervisor.submit(chain(), owner.clone()).unwrap();
        let events = supervisor.stream(task_id, &owner).unwrap().collect().await;

        let emitted: BTreeSet<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Data(delta) => Some(delta.keys().cloned().collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(emitted, BTreeSet::from(["b".to_string(), "c".to_string()]));
        match events.last() {
            Some(StreamEvent::End {
                total_yields,
                task_status,
            }) => {
                assert_eq!(*total_yields, 2);
                assert_eq!(task_status.status, TaskStatus::Completed);
            }
            other => panic!("expected end event, got {other:?}"),
        }
        let status = supervisor.status(task_id).unwrap();
        assert_eq!(status.status, TaskStatus::Completed);
        assert!(status.finished_at.is_some());
        assert!(supervisor.store().get_workflow(task_id).unwrap().marked_for_cleanup);
    }

    #[tokio::test]
    async fn edge_failure_ends_stream_with_error() {
        let supervisor = supervisor();
        let owner = UserInfo::new("u1");
        let graph = Graph::builder()
            .block("a", Block::text("x"))
            .block("b", Block::empty(BlockKind::Text))
            .edge("bad", Edge::new(EdgeKind::Code).input("a").output("b"))
            .build();
        let task_id = supervisor.submit(graph, owner.clone()).unwrap();
        let events: Vec<_> = supervisor
            .stream(task_id, &owner)
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { message, code } => {
                assert!(message.contains("timed out"));
                assert_eq!(code, "edge.execution");
            }
            other => panic!("expected error event, got {other:?}"),
        }
        let status = supervisor.status(task_id).unwrap();
        assert_eq!(status.status, TaskStatus::Failed);
        assert!(status.error_message.is_some());
    }

    #[tokio::test]
    async fn stream_checks_owner_and_existence() {
        let supervisor = supervisor();
        let task_id = supervisor.submit(chain(), UserInfo::new("owner")).unwrap();
        let err = supervisor
            .stream(task_id, &UserInfo::new("intruder"))
            .err()
            .unwrap();
        assert_eq!(err.code(), "resource.unauthorized");
        let err = supervisor
            .stream(TaskId::new(), &UserInfo::new("owner"))
            .err()
            .unwrap();
        assert_eq!(err.code(), "resource.not_found");
        assert!(supervisor.status(TaskId::new()).is_none());
    }

    #[tokio::test]
    async fn invalid_graphs_are_rejected_before_running() {
        let supervisor = supervisor();
        let unregistered = Graph::builder()
            .block("a", Block::text("x"))
            .block("b", Block::empty(BlockKind::Text))
            .edge("e", Edge::new(EdgeKind::Search).input("a").output("b"))
            .build();
        let err = supervisor
            .submit(unregistered, UserInfo::new("u"))
            .unwrap_err();
        assert_eq!(err.code(), "config.unregistered_kind");
        assert_eq!(err.stage(), Stage::Submit);

        let bad_version = json!({ "version": "2.0", "blocks": {}, "edges": {} });
        let err = supervisor
            .submit_json(bad_version, UserInfo::new("u"))
            .unwrap_err();
        assert_eq!(err.code(), "config.unsupported_version");
        assert!(supervisor.store().is_empty());
    }

    #[tokio::test]
    async fn chain_progress_counts_processed_blocks() {
        let supervisor = supervisor();
        let owner = UserInfo::new("u1");
        let task_id = supervisor.submit(chain(), owner.clone()).unwrap();
        supervisor.stream(task_id, &owner).unwrap().collect().await;
        assert_eq!(supervisor.status(task_id).unwrap().progress_percentage, 60.0);
    }

    /// `a -> b` grows the text; the condition sends `b` back into `a` until it is long enough,
    /// which re-arms `grow` and marks `b` pending again.
    fn loop_back() -> Graph {
        let cases = json!({
            "again": {
                "conditions": [{ "block": "b", "condition": "less_than_n_chars", "parameters": { "value": 4 }, "operation": "/" }],
                "then": { "from": "b", "to": "a" }
            },
            "finish": {
                "conditions": [{ "block": "b", "condition": "greater_than_n_chars", "parameters": { "value": 3 }, "operation": "/" }],
                "then": { "from": "b", "to": "done" }
            }
        });
        Graph::builder()
            .block("a", Block::text("x"))
            .block("b", Block::empty(BlockKind::Text))
            .block("done", Block::empty(BlockKind::Text))
            .edge("grow", render("a", "b", "{{a}}x"))
            .edge(
                "check",
                Edge::new(EdgeKind::Condition)
                    .input("b")
                    .output("a")
                    .output("done")
                    .with_field("cases", cases),
            )
            .build()
    }

    #[tokio::test]
    async fn reported_progress_holds_through_loop_back() {
        let supervisor = supervisor();
        let task_id = TaskId::new();
        supervisor.store().insert_task(task_id, loop_back());
        let flow = WorkFlow::new(
            task_id,
            supervisor.store().clone(),
            supervisor.registry().clone(),
            Arc::new(Semaphore::new(2)),
        );
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut state = TaskState::new(UserInfo::new("u1"), Arc::new(Mutex::new(rx)));

        let mut raw = Vec::new();
        let mut reported = Vec::new();
        while flow.step().await.unwrap().is_some() {
            let progress = supervisor
                .store()
                .update_task(task_id, |task| task.state.progress_percentage())
                .unwrap();
            raw.push(progress);
            state.observe_progress(progress);
            reported.push(state.snapshot(task_id).progress_percentage);
        }

        assert!(raw.windows(2).any(|w| w[1] < w[0]), "raw progress never dipped: {raw:?}");
        assert!(reported.windows(2).all(|w| w[1] >= w[0]), "{reported:?}");
        assert_eq!(reported.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn status_progress_never_decreases_on_loop_back() {
        let supervisor = supervisor();
        let owner = UserInfo::new("u1");
        let task_id = supervisor.submit(loop_back(), owner.clone()).unwrap();
        let mut last = 0.0;
        let mut stream = supervisor.stream(task_id, &owner).unwrap();
        while stream.next_event().await.is_some() {
            let progress = supervisor.status(task_id).unwrap().progress_percentage;
            assert!(progress >= last, "progress fell from {last} to {progress}");
            last = progress;
        }
        assert_eq!(last, 100.0);
    }

    #[tokio::test]
    async fn empty_graph_completes_without_data() {
        let supervisor = supervisor();
        let owner = UserInfo::new("u1");
        let response = supervisor
            .submit_json(json!({ "blocks": {}, "edges": {} }), owner.clone())
            .unwrap();
        let events = supervisor
            .stream(response.task_id, &owner)
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::End { total_yields: 0, .. }));
    }

    #[tokio::test]
    async fn sweep_drops_finished_state_after_retention() {
        let supervisor = supervisor();
        let owner = UserInfo::new("u1");
        let task_id = supervisor.submit(chain(), owner.clone()).unwrap();
        supervisor.stream(task_id, &owner).unwrap().collect().await;
        assert_eq!(supervisor.sweep(Duration::from_secs(3_600)), 0);
        assert!(supervisor.status(task_id).is_some());
        assert_eq!(
            supervisor.sweep_at(Instant::now() + Duration::from_secs(7_200), Duration::from_secs(3_600)),
            1
        );
        assert!(supervisor.status(task_id).is_none());
    }

    #[tokio::test]
    async fn background_sweeper_clears_expired_tasks_and_stops_when_dropped() {
        let registry = EdgeRegistry::builder().register(Arc::new(Render)).build().unwrap();
        let supervisor = Supervisor::new(
            Arc::new(registry),
            EngineConfig {
                stream_poll_ms: 20,
                cleanup_grace_secs: 0,
                ..EngineConfig::default()
            },
        );
        let owner = UserInfo::new("u1");
        let task_id = supervisor.submit(chain(), owner.clone()).unwrap();
        supervisor.stream(task_id, &owner).unwrap().collect().await;
        assert!(supervisor.store().contains(task_id));

        let sweeper = supervisor.spawn_sweeper_every(Duration::from_millis(20), Duration::ZERO);
        let mut swept = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !supervisor.store().contains(task_id) && supervisor.status(task_id).is_none() {
                swept = true;
                break;
            }
        }
        assert!(swept, "sweeper did not remove the finished task");
        assert!(!supervisor.store().has_lock(task_id));

        drop(supervisor);
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper kept running after the supervisor was dropped")
            .unwrap();
    }
}
