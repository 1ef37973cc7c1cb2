//! Status and snapshot types reported by the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mediahub_core::types::{PoolId, TaskId};

use crate::result::TaskResult;

/// Lifecycle state of a task.
///
/// `Created -> Queued -> Running -> {Success | Error | Canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Constructed but not yet queued.
    Created,
    /// Waiting for a worker.
    Queued,
    /// Owned by a worker.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with a recorded error.
    Error,
    /// Stopped after an external cancellation request.
    Canceled,
}

impl TaskStatus {
    /// Whether the status is one of the three terminal outcomes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Point-in-time progress of a task pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Number of tasks in a terminal state, failed ones included.
    pub complete: usize,
    /// Number of tasks that ended in `Error`.
    pub failed: usize,
    /// Number of tasks added so far (frozen once all are queued).
    pub total: usize,
    /// `complete / total`, between 0.0 and 1.0.
    pub progress: f64,
    /// Wall-clock time since the first task began running.
    pub runtime: Duration,
}

impl PoolStatus {
    pub(crate) fn new(
        complete: usize,
        failed: usize,
        total: usize,
        all_queued: bool,
        runtime: Duration,
    ) -> Self {
        let progress = if total == 0 {
            if all_queued { 1.0 } else { 0.0 }
        } else {
            complete as f64 / total as f64
        };
        Self {
            complete,
            failed,
            total,
            progress,
            runtime,
        }
    }
}

/// Counters describing the worker pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStatus {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks accepted since the service started.
    pub lifetime_queued: u64,
    /// Workers currently executing a task.
    pub busy: usize,
    /// Live worker loops.
    pub workers: usize,
}

/// Serializable view of a task, as mirrored to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier
    pub task_id: TaskId,
    /// Job the task runs
    pub job_name: String,
    /// Current status
    pub status: TaskStatus,
    /// Cumulative result
    pub result: TaskResult,
    /// Recorded error message, if the task failed
    pub error: Option<String>,
    /// Pool the task belongs to
    pub pool_id: Option<PoolId>,
    /// Time spent running, once started
    pub execution_time: Option<Duration>,
}
