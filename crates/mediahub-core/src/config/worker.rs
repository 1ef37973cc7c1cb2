//! Task engine worker configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the task scheduling engine's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkerConfig {
    /// Number of long-lived worker loops (0 = auto-detect CPU count).
    #[serde(default)]
    pub workers: usize,
    /// Maximum interval in seconds between worker pool status reports.
    #[serde(default = "default_status_interval")]
    pub status_report_interval_seconds: u64,
    /// Time in seconds to wait for in-flight jobs during shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl TaskWorkerConfig {
    /// Resolve the configured worker count, falling back to the number of
    /// available processors when set to zero.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            status_report_interval_seconds: default_status_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

fn default_status_interval() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    30
}
