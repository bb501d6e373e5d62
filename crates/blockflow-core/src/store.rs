//! Thread-safe per-task state.
//!
//! Two levels of locking: the sharded [`DashMap`] guards structural changes to the task map and
//! is held only for the duration of a single call; the per-task lock (a one-permit semaphore,
//! created on first use) serialises multi-step operations on one task such as a scheduler merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ResourceError, Stage};
use crate::model::{Graph, TaskId};
use crate::runtime::GraphState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One submitted graph instance.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub state: GraphState,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Instant,
    pub marked_for_cleanup: bool,
    pub expire_at: Option<Instant>,
}

/// Requests cancellation of a running scheduler.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn pair() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    /// Best-effort: the scheduler observes it before its next iteration.
    pub fn abort(&self) -> bool {
        self.tx.send(true).is_ok()
    }
}

/// Receiving side of an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        AbortHandle::pair().1
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }
}

pub struct TaskStore {
    tasks: DashMap<TaskId, Task>,
    locks: DashMap<TaskId, Arc<Semaphore>>,
    aborts: DashMap<TaskId, AbortHandle>,
    cleanup_grace: Duration,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.tasks.len())
            .field("cleanup_grace", &self.cleanup_grace)
            .finish()
    }
}

impl TaskStore {
    pub fn new(cleanup_grace: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            locks: DashMap::new(),
            aborts: DashMap::new(),
            cleanup_grace,
        }
    }

    pub fn insert_task(&self, task_id: TaskId, graph: Graph) {
        let task = Task {
            task_id,
            state: GraphState::new(graph),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            last_accessed: Instant::now(),
            marked_for_cleanup: false,
            expire_at: None,
        };
        self.tasks.insert(task_id, task);
    }

    /// Attach the handle [`cleanup_task`](Self::cleanup_task) fires for this task.
    pub fn register_abort(&self, task_id: TaskId, handle: AbortHandle) {
        self.aborts.insert(task_id, handle);
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub fn has_lock(&self, task_id: TaskId) -> bool {
        self.locks.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Snapshot of the task; refreshes `last_accessed`.
    pub fn get_workflow(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let mut entry = self.tasks.get_mut(&task_id).ok_or_else(|| not_found(task_id))?;
        entry.last_accessed = Instant::now();
        Ok(entry.value().clone())
    }

    /// Run `f` on the task under the map lock. Keep `f` short; it blocks the shard.
    pub fn update_task<R>(
        &self,
        task_id: TaskId,
        f: impl FnOnce(&mut Task) -> R,
    ) -> Result<R, EngineError> {
        let mut entry = self.tasks.get_mut(&task_id).ok_or_else(|| not_found(task_id))?;
        entry.last_accessed = Instant::now();
        Ok(f(entry.value_mut()))
    }

    pub fn set_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), EngineError> {
        self.update_task(task_id, |task| task.status = status)
    }

    fn lock_for(&self, task_id: TaskId) -> Option<Arc<Semaphore>> {
        if !self.tasks.contains_key(&task_id) {
            return None;
        }
        Some(
            self.locks
                .entry(task_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone(),
        )
    }

    /// Acquire the per-task lock. Non-blocking mode returns at once; blocking mode waits up to
    /// `timeout` (forever when `None`). Returns `false` when the lock was not obtained or the
    /// task does not exist.
    pub async fn acquire_task_lock(
        &self,
        task_id: TaskId,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> bool {
        let Some(lock) = self.lock_for(task_id) else {
            return false;
        };
        let acquired = if !blocking {
            lock.try_acquire().ok()
        } else if let Some(timeout) = timeout {
            tokio::time::timeout(timeout, lock.acquire())
                .await
                .ok()
                .and_then(Result::ok)
        } else {
            lock.acquire().await.ok()
        };
        match acquired {
            Some(permit) => {
                permit.forget();
                true
            }
            None => false,
        }
    }

    /// Release the per-task lock. Releasing a lock that is not held is a no-op.
    pub fn release_task_lock(&self, task_id: TaskId) {
        if let Some(lock) = self.locks.get(&task_id)
            && lock.available_permits() == 0
        {
            lock.add_permits(1);
        }
    }

    /// Acquire the task lock with a timeout, or fail with a lock-timeout resource error.
    pub async fn lock_or_timeout(
        &self,
        task_id: TaskId,
        timeout: Duration,
        stage: Stage,
    ) -> Result<(), EngineError> {
        if !self.contains(task_id) {
            return Err(EngineError::resource(stage, ResourceError::TaskNotFound(task_id)));
        }
        if self.acquire_task_lock(task_id, true, Some(timeout)).await {
            Ok(())
        } else {
            Err(EngineError::resource(stage, ResourceError::LockTimeout(task_id)))
        }
    }

    pub fn cleanup_task(&self, task_id: TaskId) -> Result<(), EngineError> {
        self.cleanup_task_at(task_id, Instant::now())
    }

    /// Fire the task's abort handle and schedule removal `cleanup_grace` after `now`.
    pub fn cleanup_task_at(&self, task_id: TaskId, now: Instant) -> Result<(), EngineError> {
        if let Some((_, handle)) = self.aborts.remove(&task_id)
            && !handle.abort()
        {
            debug!(%task_id, "scheduler already detached when cleanup fired");
        }
        let grace = self.cleanup_grace;
        self.update_task(task_id, |task| {
            task.marked_for_cleanup = true;
            task.expire_at = Some(now + grace);
        })
        .inspect_err(|err| warn!(%task_id, error = %err, "cleanup of unknown task"))?;
        debug!(%task_id, grace_secs = grace.as_secs(), "task marked for cleanup");
        Ok(())
    }

    /// Remove tasks whose expiry has passed, together with their lock entries.
    pub fn sweep_expired(&self, now: Instant) -> Vec<TaskId> {
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| entry.expire_at.is_some_and(|at| at <= now))
            .map(|entry| *entry.key())
            .collect();
        for task_id in &expired {
            self.tasks.remove(task_id);
            self.locks.remove(task_id);
            self.aborts.remove(task_id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "swept expired tasks");
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on a fixed interval until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep_expired(Instant::now());
            }
        })
    }
}

fn not_found(task_id: TaskId) -> EngineError {
    EngineError::resource(Stage::Store, ResourceError::TaskNotFound(task_id))
}
