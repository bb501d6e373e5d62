use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TryRecvError;

use super::TaskState;
use super::status::TaskStatusSnapshot;
use crate::model::TaskId;
use crate::runtime::Delta;

/// One event of a task's result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Blocks written by one scheduler iteration.
    Data(Delta),
    /// The task completed.
    End {
        total_yields: u32,
        task_status: TaskStatusSnapshot,
    },
    /// The task failed; `code` is the [`EngineError::code`](crate::EngineError::code).
    Error { message: String, code: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Data(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            StreamEvent::Data(delta) => json!({ "data": delta, "is_complete": false }),
            StreamEvent::End {
                total_yields,
                task_status,
            } => json!({
                "is_complete": true,
                "total_yields": total_yields,
                "task_status": task_status,
            }),
            StreamEvent::Error { message, code } => json!({
                "error": message,
                "code": code,
                "is_complete": true,
            }),
        }
    }

    /// Server-sent-events frame: `data: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

pub(super) type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<StreamEvent>>>;

/// Consumer side of a task's result queue.
pub struct TaskStream {
    task_id: TaskId,
    queue: SharedQueue,
    tasks: Arc<DashMap<TaskId, TaskState>>,
    poll: Duration,
    finished: bool,
}

impl TaskStream {
    pub(super) fn new(
        task_id: TaskId,
        queue: SharedQueue,
        tasks: Arc<DashMap<TaskId, TaskState>>,
        poll: Duration,
    ) -> Self {
        Self {
            task_id,
            queue,
            tasks,
            poll,
            finished: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Next event, or `None` once the terminal event was delivered or the task has ended with
    /// nothing left to read.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        while !self.finished {
            let mut rx = self.queue.lock().await;
            match tokio::time::timeout(self.poll, rx.recv()).await {
                Ok(Some(event)) => {
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Ok(None) => self.finished = true,
                Err(_) => {
                    let ended = self
                        .tasks
                        .get(&self.task_id)
                        .is_none_or(|state| state.status.is_terminal());
                    match rx.try_recv() {
                        Ok(event) => {
                            self.finished = event.is_terminal();
                            return Some(event);
                        }
                        Err(TryRecvError::Disconnected) => self.finished = true,
                        Err(TryRecvError::Empty) if ended => self.finished = true,
                        Err(TryRecvError::Empty) => {}
                    }
                }
            }
        }
        None
    }

    /// Drain the stream into a vector.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_event().await.map(|event| (event, stream))
        })
    }
}
