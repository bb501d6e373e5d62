//! Submit a graph file to an in-process supervisor and print its result stream as SSE frames.
//!
//! Logs go to stderr (or `BLOCKFLOW_JSON_LOG_PATH`), so stdout carries only the frames.

mod error;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use blockflow_core::{EngineConfig, init_observability};
use clap::Parser;
use tracing::error;

use crate::error::RunnerError;
use crate::run::{RunOptions, check_graph, load_graph, run_graph};

#[derive(Debug, Parser)]
#[command(name = "blockflow", version, about = "Run a blockflow graph and stream its results")]
struct Cli {
    /// Graph JSON file: `{"version", "blocks", "edges"}`.
    graph: PathBuf,
    /// User id the task is submitted and streamed as.
    #[arg(long, default_value = "local")]
    user: String,
    /// Register `llm` and `rewrite` edges backed by the OpenAI API (`OPENAI_API_KEY`).
    #[arg(long)]
    openai: bool,
    /// Default chat model for `--openai`.
    #[arg(long, requires = "openai")]
    model: Option<String>,
    /// Concurrent edge executions; overrides `BLOCKFLOW_WORKER_POOL_SIZE`.
    #[arg(long)]
    workers: Option<usize>,
    /// Iteration budget; overrides `BLOCKFLOW_MAX_ITERATIONS`.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Only validate the graph file, do not run it.
    #[arg(long)]
    check: bool,
}

impl Cli {
    fn options(&self) -> RunOptions {
        let mut config = EngineConfig::from_env();
        if let Some(workers) = self.workers {
            config.worker_pool_size = workers;
        }
        if let Some(max_iterations) = self.max_iterations {
            config.max_iterations = max_iterations;
        }
        RunOptions {
            user: self.user.clone(),
            openai: self.openai,
            model: self.model.clone(),
            config: config.normalized(),
        }
    }
}

async fn run(cli: Cli) -> Result<(), RunnerError> {
    let graph = load_graph(&cli.graph)?;
    let options = cli.options();
    if cli.check {
        check_graph(&graph, &options)?;
        eprintln!(
            "{}: {} blocks, {} edges",
            cli.graph.display(),
            graph.blocks.len(),
            graph.edges.len()
        );
        return Ok(());
    }
    let mut stdout = std::io::stdout().lock();
    run_graph(graph, &options, &mut stdout).await.map(|_| ())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "run failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
