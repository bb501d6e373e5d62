//! Batch scheduler.
//!
//! Each iteration selects every ready edge, resolves its inputs from a snapshot, runs the batch
//! on the bounded worker pool and merges the results into the task under its lock. The run ends
//! when an iteration finds nothing ready.

mod graph;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, debug_span, info, info_span, warn};

use crate::error::{ConfigError, EdgeError, EngineError, ResourceError, Stage};
use crate::executor::{EdgeRegistry, dispatch};
use crate::model::{BlockId, EdgeKind, TaskId};
use crate::parser::{ResolvedEdge, resolve_edge};
use crate::store::{AbortSignal, TaskStore};

pub use graph::{
    BlockState, EdgeState, GraphState, consumers, downstream_edges, ready_edges,
};

/// Default iteration budget; condition loops that never settle stop here.
pub const ITERATION_BUDGET: u32 = 10_000;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks written in one iteration and their new content.
pub type Delta = BTreeMap<BlockId, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub max_iterations: u32,
    pub lock_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_iterations: ITERATION_BUDGET,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations that executed at least one edge.
    pub iterations: u32,
    /// Non-empty deltas sent.
    pub yields: u32,
}

/// Scheduler for one task.
pub struct WorkFlow {
    task_id: TaskId,
    store: Arc<TaskStore>,
    registry: Arc<EdgeRegistry>,
    pool: Arc<Semaphore>,
    options: SchedulerOptions,
    abort: AbortSignal,
}

impl WorkFlow {
    pub fn new(
        task_id: TaskId,
        store: Arc<TaskStore>,
        registry: Arc<EdgeRegistry>,
        pool: Arc<Semaphore>,
    ) -> Self {
        Self {
            task_id,
            store,
            registry,
            pool,
            options: SchedulerOptions::default(),
            abort: AbortSignal::never(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Iterate until no edge is ready, sending each non-empty delta on `deltas`.
    pub async fn run(&self, deltas: &mpsc::UnboundedSender<Delta>) -> Result<RunSummary, EngineError> {
        let span = info_span!("workflow", task_id = %self.task_id);
        async move {
            let mut summary = RunSummary::default();
            loop {
                self.check_cancelled()?;
                if summary.iterations >= self.options.max_iterations {
                    return Err(EngineError::IterationBudgetExceeded(self.options.max_iterations));
                }
                let Some(delta) = self.step().await? else {
                    break;
                };
                summary.iterations += 1;
                if !delta.is_empty() {
                    summary.yields += 1;
                    if deltas.send(delta).is_err() {
                        debug!("delta receiver dropped");
                    }
                }
            }
            info!(iterations = summary.iterations, yields = summary.yields, "workflow settled");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        let marked = self
            .store
            .update_task(self.task_id, |task| task.marked_for_cleanup)?;
        if marked || self.abort.is_aborted() {
            return Err(EngineError::resource(
                Stage::Schedule,
                ResourceError::Cancelled(self.task_id),
            ));
        }
        Ok(())
    }

    /// One select/execute/merge pass. Returns `None` when nothing was ready.
    pub async fn step(&self) -> Result<Option<Delta>, EngineError> {
        let snapshot = self.store.get_workflow(self.task_id)?;
        let ready = ready_edges(&snapshot.state);
        if ready.is_empty() {
            return Ok(None);
        }
        debug!(batch = ready.len(), edges = ?ready, "selected ready edges");

        let resolved = ready
            .iter()
            .map(|edge_id| {
                let edge = snapshot.state.edges.get(edge_id).ok_or_else(|| {
                    ConfigError::MalformedGraph(format!("edge {edge_id} vanished from task"))
                })?;
                resolve_edge(edge_id, edge, &snapshot.state.blocks)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::config(Stage::Resolve, e))?;

        let results = self.execute(resolved).await?;

        self.store
            .lock_or_timeout(self.task_id, self.options.lock_timeout, Stage::Merge)
            .await?;
        let merged = self
            .store
            .update_task(self.task_id, |task| merge(&mut task.state, &results));
        self.store.release_task_lock(self.task_id);
        merged.map(Some)
    }

    /// Run the batch on the worker pool. Every edge finishes before the first error is returned.
    async fn execute(
        &self,
        batch: Vec<ResolvedEdge>,
    ) -> Result<Vec<(ResolvedEdge, Delta)>, EngineError> {
        let mut joins = Vec::with_capacity(batch.len());
        for edge in batch {
            let permit = self.pool.clone().acquire_owned().await.map_err(|e| {
                EngineError::resource(Stage::Dispatch, ResourceError::WorkerPool(e.to_string()))
            })?;
            let registry = self.registry.clone();
            let span = debug_span!("edge", edge_id = %edge.edge_id, kind = %edge.kind);
            let owner = (edge.edge_id.clone(), edge.kind);
            joins.push((owner, tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let _enter = span.enter();
                let writes = dispatch(&edge, &registry).and_then(|out| {
                    out.into_writes(&edge)
                        .map_err(|e| EngineError::config(Stage::Merge, e))
                });
                (edge, writes)
            })));
        }

        let mut results = Vec::with_capacity(joins.len());
        let mut first_error = None;
        for ((edge_id, kind), join) in joins {
            match join.await {
                Ok((edge, Ok(writes))) => results.push((edge, writes)),
                Ok((edge, Err(err))) => {
                    debug!(edge_id = %edge.edge_id, error = %err, "edge failed");
                    first_error.get_or_insert(err);
                }
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    warn!(%edge_id, %kind, %message, "edge executor panicked");
                    first_error.get_or_insert(EngineError::edge(
                        edge_id,
                        kind,
                        EdgeError::Other(format!("executor panicked: {message}")),
                    ));
                }
                Err(join_err) => {
                    first_error.get_or_insert(EngineError::resource(
                        Stage::Dispatch,
                        ResourceError::WorkerPool(join_err.to_string()),
                    ));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "non-string panic payload".to_string(), |s| (*s).to_string()),
    }
}

/// Apply a batch to the task state and return the combined delta.
fn merge(state: &mut GraphState, results: &[(ResolvedEdge, Delta)]) -> Delta {
    let mut delta = Delta::new();
    for (edge, writes) in results {
        state.apply(&edge.edge_id, writes);
        if edge.kind == EdgeKind::Condition {
            for target in writes.keys() {
                let rearmed = state.rearm_downstream(target);
                if !rearmed.is_empty() {
                    debug!(edge_id = %edge.edge_id, target = %target, rearmed = ?rearmed, "condition redirect re-armed edges");
                }
            }
        }
        delta.extend(writes.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    delta
}
