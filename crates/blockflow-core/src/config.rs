//! Engine settings.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::{ITERATION_BUDGET, SchedulerOptions};

/// Tunables for the scheduler, task store and supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Edges executed concurrently across all tasks.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Delay between `cleanup_task` and removal of the task from the store.
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long `next_event` waits before re-checking whether the task has ended.
    #[serde(default = "default_stream_poll_ms")]
    pub stream_poll_ms: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Supervisor state of finished tasks is kept this long for status queries.
    #[serde(default = "default_state_retention_secs")]
    pub state_retention_secs: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

const fn default_worker_pool_size() -> usize {
    8
}

const fn default_cleanup_grace_secs() -> u64 {
    30
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

const fn default_stream_poll_ms() -> u64 {
    100
}

const fn default_max_iterations() -> u32 {
    ITERATION_BUDGET
}

const fn default_state_retention_secs() -> u64 {
    3_600
}

const fn default_lock_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stream_poll_ms: default_stream_poll_ms(),
            max_iterations: default_max_iterations(),
            state_retention_secs: default_state_retention_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Read `BLOCKFLOW_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let config = Self {
            worker_pool_size: read(&lookup, "BLOCKFLOW_WORKER_POOL_SIZE", defaults.worker_pool_size),
            cleanup_grace_secs: read(&lookup, "BLOCKFLOW_CLEANUP_GRACE_SECS", defaults.cleanup_grace_secs),
            sweep_interval_secs: read(&lookup, "BLOCKFLOW_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            stream_poll_ms: read(&lookup, "BLOCKFLOW_STREAM_POLL_MS", defaults.stream_poll_ms),
            max_iterations: read(&lookup, "BLOCKFLOW_MAX_ITERATIONS", defaults.max_iterations),
            state_retention_secs: read(&lookup, "BLOCKFLOW_STATE_RETENTION_SECS", defaults.state_retention_secs),
            lock_timeout_ms: read(&lookup, "BLOCKFLOW_LOCK_TIMEOUT_MS", defaults.lock_timeout_ms),
        };
        config.normalized()
    }

    /// Zero pool sizes, intervals and budgets are replaced by their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.worker_pool_size == 0 {
            self.worker_pool_size = defaults.worker_pool_size;
        }
        if self.sweep_interval_secs == 0 {
            self.sweep_interval_secs = defaults.sweep_interval_secs;
        }
        if self.stream_poll_ms == 0 {
            self.stream_poll_ms = defaults.stream_poll_ms;
        }
        if self.max_iterations == 0 {
            self.max_iterations = defaults.max_iterations;
        }
        self
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    pub fn state_retention(&self) -> Duration {
        Duration::from_secs(self.state_retention_secs)
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            max_iterations: self.max_iterations,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

fn read<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}
