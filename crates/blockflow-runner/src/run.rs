use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use blockflow_core::{EngineConfig, Graph, StreamEvent, Supervisor, UserInfo};
use blockflow_edges::{OpenAiChat, Providers, registry_with};
use futures::StreamExt as _;
use tracing::info;

use crate::error::RunnerError;

/// Options of one run, already merged from flags and environment.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub user: String,
    /// Register the OpenAI-backed `llm` and `rewrite` executors.
    pub openai: bool,
    pub model: Option<String>,
    pub config: EngineConfig,
}

pub fn load_graph(path: &Path) -> Result<Graph, RunnerError> {
    let text = std::fs::read_to_string(path).map_err(|source| RunnerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&text).map_err(|source| RunnerError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Graph::from_json(value).map_err(|source| RunnerError::Graph {
        path: path.to_path_buf(),
        source,
    })
}

fn providers(options: &RunOptions) -> Providers {
    let providers = Providers::filesystem();
    if !options.openai {
        return providers;
    }
    let chat = match &options.model {
        Some(model) => OpenAiChat::new().with_model(model),
        None => OpenAiChat::new(),
    };
    providers.with_chat(Arc::new(chat))
}

/// Run every check `submit` would make, against the registry this run would use.
pub fn check_graph(graph: &Graph, options: &RunOptions) -> Result<(), RunnerError> {
    let registry = registry_with(providers(options)).map_err(RunnerError::Registry)?;
    Supervisor::new(Arc::new(registry), options.config.clone()).validate(graph)?;
    Ok(())
}

/// Submit `graph`, write every stream event to `out` as an SSE frame and return the number of
/// data frames. An error event is returned as [`RunnerError::TaskFailed`] after it was written.
pub async fn run_graph(
    graph: Graph,
    options: &RunOptions,
    out: &mut impl Write,
) -> Result<u32, RunnerError> {
    let registry = registry_with(providers(options)).map_err(RunnerError::Registry)?;
    let supervisor = Supervisor::new(Arc::new(registry), options.config.clone());
    let user = UserInfo::new(options.user.clone());
    let task_id = supervisor.submit(graph, user.clone())?;
    info!(%task_id, user = %user.user_id, "graph submitted");

    let mut events = Box::pin(supervisor.stream(task_id, &user)?.into_stream());
    let mut frames = 0;
    while let Some(event) = events.next().await {
        out.write_all(event.to_sse().as_bytes())?;
        out.flush()?;
        match event {
            StreamEvent::Data(_) => frames += 1,
            StreamEvent::End { .. } => {}
            StreamEvent::Error { message, code } => {
                return Err(RunnerError::TaskFailed { code, message });
            }
        }
    }
    Ok(frames)
}
