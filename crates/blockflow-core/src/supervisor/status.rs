use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::TaskId;
use crate::store::TaskStatus;

/// Status query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Share of processed blocks; never decreases between polls of the same task.
    pub progress_percentage: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Submission response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}
