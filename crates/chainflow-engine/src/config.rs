//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the indexing scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between periodic flushes of function progress metadata.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Maximum number of user tasks executing concurrently.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Shared event budget for one load pass across all functions.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Total attempts per task before the error is terminal.
    #[serde(default = "default_task_attempts")]
    pub task_attempts: u32,
}

fn default_flush_interval_secs() -> u64 {
    120
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_max_batch_size() -> usize {
    10_000
}

fn default_task_attempts() -> u32 {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            worker_concurrency: default_worker_concurrency(),
            max_batch_size: default_max_batch_size(),
            task_attempts: default_task_attempts(),
        }
    }
}
