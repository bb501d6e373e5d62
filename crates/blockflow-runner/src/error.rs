use std::path::PathBuf;

use blockflow_core::{ConfigError, EngineError};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid graph in {path}: {source}")]
    Graph { path: PathBuf, source: ConfigError },
    #[error("cannot build edge registry: {0}")]
    Registry(ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),
    /// The task ran and reported an error event.
    #[error("task failed ({code}): {message}")]
    TaskFailed { code: String, message: String },
}
