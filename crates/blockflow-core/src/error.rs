//! Engine error taxonomy.
//!
//! Three classes, kept distinct all the way up to the supervisor:
//!
//! - **Configuration** ([`ConfigError`]): malformed graphs, condition cases and edge fields. Detected
//!   before any provider is called and never retried.
//! - **Edge execution** ([`EdgeError`] wrapped in [`EngineError::Edge`]): a handler failed. Task-fatal.
//! - **Resource** ([`ResourceError`]): lock timeouts, unknown tasks, unauthorized access, cancellation.

use std::fmt;

use serde::Serialize;

use crate::model::{BlockId, EdgeId, EdgeKind, TaskId};

/// Point in the pipeline where an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Submit,
    Resolve,
    Dispatch,
    Merge,
    Schedule,
    Store,
    Stream,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Submit => "submit",
            Stage::Resolve => "resolve",
            Stage::Dispatch => "dispatch",
            Stage::Merge => "merge",
            Stage::Schedule => "schedule",
            Stage::Store => "store",
            Stage::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// Failure returned by an edge executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EdgeError {
    /// An external provider (LLM, vector store, search API, sandbox) failed.
    #[error("provider error: {0}")]
    Provider(String),
    /// The resolved input does not have the shape the executor needs.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The edge's own fields are unusable for this executor.
    #[error("invalid edge config: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Other(String),
}

impl EdgeError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Configuration errors: the submitted graph cannot be executed as written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(String),
    #[error("malformed graph: {0}")]
    MalformedGraph(String),
    #[error("edge {edge_id} references unknown block {block_id}")]
    UnknownBlock { edge_id: EdgeId, block_id: BlockId },
    #[error("edge {edge_id} requires input {block_id}, which is not among its declared inputs")]
    MissingInput { edge_id: EdgeId, block_id: BlockId },
    #[error("edge {edge_id} writes block {block_id}, which is not among its declared outputs")]
    UndeclaredOutput { edge_id: EdgeId, block_id: BlockId },
    #[error("edge {edge_id}: missing required field `{field}`")]
    MissingField { edge_id: EdgeId, field: String },
    #[error("edge {edge_id}: invalid field `{field}`: {message}")]
    InvalidField {
        edge_id: EdgeId,
        field: String,
        message: String,
    },
    #[error("no executor registered for edge kind {0}")]
    UnregisteredKind(EdgeKind),
    #[error("duplicate executor registration for edge kind {0}")]
    DuplicateExecutor(EdgeKind),
    #[error("unsupported condition predicate: {0}")]
    UnsupportedPredicate(String),
    #[error("unsupported case operator: {0}")]
    UnsupportedOperator(String),
    #[error("case has {conditions} conditions but {operations} operations")]
    OperationCountMismatch { conditions: usize, operations: usize },
    #[error("case operations must end with the `/` sentinel and use it nowhere else (found `{0}`)")]
    MisplacedSentinel(String),
    #[error("case has no conditions")]
    EmptyCase,
    #[error("edge {edge_id}: invalid loop input: {message}")]
    InvalidLoop { edge_id: EdgeId, message: String },
}

/// Resource errors: the engine could not reach or own the state it needed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("timed out acquiring lock for task {0}")]
    LockTimeout(TaskId),
    #[error("user {user_id} may not access task {task_id}")]
    Unauthorized { task_id: TaskId, user_id: String },
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),
    #[error("worker pool failure: {0}")]
    WorkerPool(String),
}

/// Top-level engine error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error at {stage}: {source}")]
    Config {
        stage: Stage,
        #[source]
        source: ConfigError,
    },
    #[error("edge {edge_id} ({kind}) failed: {source}")]
    Edge {
        edge_id: EdgeId,
        kind: EdgeKind,
        #[source]
        source: EdgeError,
    },
    #[error("{source}")]
    Resource {
        stage: Stage,
        #[source]
        source: ResourceError,
    },
    #[error("iteration budget of {0} exceeded (condition loop never settled)")]
    IterationBudgetExceeded(u32),
}

impl EngineError {
    pub fn config(stage: Stage, source: ConfigError) -> Self {
        Self::Config { stage, source }
    }

    pub fn edge(edge_id: impl Into<EdgeId>, kind: EdgeKind, source: EdgeError) -> Self {
        Self::Edge {
            edge_id: edge_id.into(),
            kind,
            source,
        }
    }

    pub fn resource(stage: Stage, source: ResourceError) -> Self {
        Self::Resource { stage, source }
    }

    /// Stable machine-readable code, used in logs and terminal stream events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config { source, .. } => match source {
                ConfigError::UnsupportedVersion(_) => "config.unsupported_version",
                ConfigError::MalformedGraph(_) => "config.malformed_graph",
                ConfigError::UnknownBlock { .. } => "config.unknown_block",
                ConfigError::MissingInput { .. } => "config.missing_input",
                ConfigError::UndeclaredOutput { .. } => "config.undeclared_output",
                ConfigError::MissingField { .. } => "config.missing_field",
                ConfigError::InvalidField { .. } => "config.invalid_field",
                ConfigError::UnregisteredKind(_) => "config.unregistered_kind",
                ConfigError::DuplicateExecutor(_) => "config.duplicate_executor",
                ConfigError::UnsupportedPredicate(_) => "config.unsupported_predicate",
                ConfigError::UnsupportedOperator(_) => "config.unsupported_operator",
                ConfigError::OperationCountMismatch { .. } => "config.operation_count",
                ConfigError::MisplacedSentinel(_) => "config.misplaced_sentinel",
                ConfigError::EmptyCase => "config.empty_case",
                ConfigError::InvalidLoop { .. } => "config.invalid_loop",
            },
            EngineError::Edge { .. } => "edge.execution",
            EngineError::Resource { source, .. } => match source {
                ResourceError::TaskNotFound(_) => "resource.not_found",
                ResourceError::LockTimeout(_) => "resource.lock_timeout",
                ResourceError::Unauthorized { .. } => "resource.unauthorized",
                ResourceError::Cancelled(_) => "resource.cancelled",
                ResourceError::WorkerPool(_) => "resource.worker_pool",
            },
            EngineError::IterationBudgetExceeded(_) => "schedule.iteration_budget",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            EngineError::Config { stage, .. } | EngineError::Resource { stage, .. } => *stage,
            EngineError::Edge { .. } => Stage::Dispatch,
            EngineError::IterationBudgetExceeded(_) => Stage::Schedule,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, EngineError::Config { .. })
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, EngineError::Resource { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_error_message_carries_edge_context() {
        let err = EngineError::edge("e1", EdgeKind::Llm, EdgeError::provider("rate limited"));
        let msg = err.to_string();
        assert!(msg.contains("e1"));
        assert!(msg.contains("llm"));
        assert!(msg.contains("rate limited"));
        assert_eq!(err.code(), "edge.execution");
        assert_eq!(err.stage(), Stage::Dispatch);
    }

    #[test]
    fn config_and_resource_codes_are_distinct() {
        let config = EngineError::config(Stage::Submit, ConfigError::EmptyCase);
        let resource = EngineError::resource(
            Stage::Stream,
            ResourceError::TaskNotFound(TaskId::new()),
        );
        assert!(config.is_config());
        assert!(resource.is_resource());
        assert_ne!(config.code(), resource.code());
        assert_eq!(resource.stage(), Stage::Stream);
    }
}
