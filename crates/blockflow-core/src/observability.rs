//! Process-wide tracing setup.
//!
//! The engine logs under three nested spans: `task` (supervisor run), `workflow` (scheduler) and
//! `edge` (one executor invocation, debug level). File output records span closes so every task
//! and edge leaves its elapsed time in the JSONL log.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "blockflow.logs.jsonl";

/// Provider HTTP clients are chatty at `info`; keep them at `warn` unless asked otherwise.
const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper_util=warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Disabled,
    /// Compact lines on stderr. Stdout stays free for stream frames.
    Console,
    JsonFile { dir: PathBuf, file_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub sink: LogSink,
    pub filter: String,
}

impl LogSettings {
    /// Environment variables:
    /// - `BLOCKFLOW_OBSERVABILITY_ENABLED`: enable/disable flag (default enabled).
    /// - `BLOCKFLOW_LOG_LEVEL`: level or filter directive (`info`, `blockflow_core=debug`, ...).
    /// - `RUST_LOG`: filter used when `BLOCKFLOW_LOG_LEVEL` is unset or invalid.
    /// - `BLOCKFLOW_JSON_LOG_PATH`: write JSONL to this file instead of the console.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("BLOCKFLOW_OBSERVABILITY_ENABLED")
            .map(|value| parse_bool_env(&value).unwrap_or(true))
            .unwrap_or(true);
        let filter = ["BLOCKFLOW_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .find(|directive| EnvFilter::try_new(directive).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let sink = match (enabled, lookup("BLOCKFLOW_JSON_LOG_PATH")) {
            (false, _) => LogSink::Disabled,
            (true, Some(path)) => json_sink(Path::new(&path)),
            (true, None) => LogSink::Console,
        };
        Self { sink, filter }
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn json_sink(path: &Path) -> LogSink {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    LogSink::JsonFile {
        dir: dir.to_path_buf(),
        file_name: file_name.to_string(),
    }
}

/// Install the process-wide tracing subscriber from [`LogSettings::from_env`].
/// Later calls are no-ops.
pub fn init_observability() {
    INIT.get_or_init(|| install(LogSettings::from_env()));
}

fn install(settings: LogSettings) {
    let env_filter = EnvFilter::new(&settings.filter);
    match settings.sink {
        LogSink::Disabled => {}
        LogSink::JsonFile { dir, file_name } => {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                eprintln!("cannot create log directory {}: {err}", dir.display());
            }
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        }
        LogSink::Console => {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    }
}
