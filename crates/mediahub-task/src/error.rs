//! Error taxonomy for the task engine.

use std::sync::Arc;

use thiserror::Error;

use mediahub_core::error::{AppError, ErrorKind};
use mediahub_core::types::{PoolId, TaskId};

/// An error recorded on a task that ended in [`TaskStatus::Error`].
///
/// [`TaskStatus::Error`]: crate::status::TaskStatus::Error
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The job function's own logic failed.
    #[error("{0}")]
    Job(Arc<dyn std::error::Error + Send + Sync>),

    /// Tasks in the child pool failed and the parent chose to fail itself.
    #[error("{failed} child task(s) failed")]
    ChildTaskFailed {
        /// Number of failed child tasks
        failed: usize,
    },

    /// The task's armed deadline elapsed before it reached a terminal state.
    #[error("task timed out")]
    Timeout,

    /// The job function panicked; the worker contained it.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Wrap any error (or message) as a job error.
    pub fn job(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Job(Arc::from(err.into()))
    }

    /// Whether this error was produced by the watchdog.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Sentinel returned by job functions to leave the job body early.
///
/// It is only produced by the task methods that have already settled the
/// task (`fail`, `error_and_exit`, `req_no_err`, `exit_if_signaled`), so
/// propagating it with `?` is all a job needs to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskExit {
    /// The task was failed and its error recorded.
    #[error("task exited with an error")]
    Failed,
    /// The task honored a cancellation request.
    #[error("task exited after cancellation")]
    Canceled,
}

/// Errors returned by [`TaskService`](crate::service::TaskService) operations.
#[derive(Debug, Error)]
pub enum TaskServiceError {
    /// No job function is registered under this name.
    #[error("trying to dispatch non-registered job: {0}")]
    UnknownJob(String),

    /// The dispatched name and the metadata's job name disagree.
    #[error("job name '{dispatched}' does not match task metadata job '{metadata}'")]
    JobNameMismatch {
        /// Name passed to dispatch
        dispatched: String,
        /// Name reported by the metadata
        metadata: String,
    },

    /// The metadata failed its own verification.
    #[error("invalid metadata for job '{job}'")]
    InvalidMetadata {
        /// Job being dispatched
        job: String,
        /// Verification failure
        #[source]
        source: AppError,
    },

    /// The pool was signalled all-queued or cancelled.
    #[error("attempting to add task to closed task pool {0}")]
    PoolClosed(PoolId),

    /// The service no longer accepts work.
    #[error("not queuing task while the task service is shutting down")]
    ShuttingDown,

    /// A task may own at most one child pool.
    #[error("task {0} already has a child task pool")]
    ChildPoolAlreadySet(TaskId),
}

impl From<TaskServiceError> for AppError {
    fn from(err: TaskServiceError) -> Self {
        let kind = match &err {
            TaskServiceError::UnknownJob(_) => ErrorKind::NotFound,
            TaskServiceError::JobNameMismatch { .. } | TaskServiceError::InvalidMetadata { .. } => {
                ErrorKind::Validation
            }
            TaskServiceError::PoolClosed(_) | TaskServiceError::ChildPoolAlreadySet(_) => {
                ErrorKind::Conflict
            }
            TaskServiceError::ShuttingDown => ErrorKind::ServiceUnavailable,
        };
        AppError::with_source(kind, err.to_string(), err)
    }
}
