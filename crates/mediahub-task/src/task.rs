//! A single schedulable unit of work.
//!
//! A [`Task`] is created by [`TaskService::dispatch_job`] and handed to a
//! worker, which runs the registered job function with the task as its
//! handle. Status and result are mutated by the owning worker;
//! other holders may only observe the task or request cancellation.
//!
//! [`TaskService::dispatch_job`]: crate::service::TaskService::dispatch_job

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing;

use mediahub_core::types::{PoolId, TaskId};

use crate::error::{TaskError, TaskExit, TaskServiceError};
use crate::metadata::TaskMetadata;
use crate::pool::TaskPool;
use crate::result::TaskResult;
use crate::status::{TaskSnapshot, TaskStatus};

/// Callback invoked with the full merged result after every `set_result`.
pub type ResultHook = Arc<dyn Fn(&TaskResult) + Send + Sync>;

type PostAction = Box<dyn FnOnce(&TaskResult) + Send>;
type CleanupHook = Box<dyn FnOnce(&Task) + Send>;

#[derive(Default)]
struct Hooks {
    on_result: Option<ResultHook>,
    post_action: Option<PostAction>,
    cleanup: Option<CleanupHook>,
    error_cleanup: Option<CleanupHook>,
}

struct TaskState {
    status: TaskStatus,
    result: TaskResult,
    error: Option<TaskError>,
    hooks: Hooks,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// A unit of work with its own result and cancellation state.
pub struct Task {
    id: TaskId,
    job_name: String,
    metadata: Arc<dyn TaskMetadata>,
    meta_any: Arc<dyn Any + Send + Sync>,
    pool: Weak<TaskPool>,
    pool_id: PoolId,
    child_pool: OnceLock<Arc<TaskPool>>,
    state: Mutex<TaskState>,
    signal: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
    exited: watch::Sender<bool>,
    created_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new<M: TaskMetadata>(id: TaskId, metadata: M, pool: &Arc<TaskPool>) -> Arc<Self> {
        let job_name = metadata.job_name().to_string();
        let metadata = Arc::new(metadata);
        let meta_any: Arc<dyn Any + Send + Sync> = metadata.clone();

        Arc::new(Self {
            id,
            job_name,
            metadata,
            meta_any,
            pool: Arc::downgrade(pool),
            pool_id: pool.id(),
            child_pool: OnceLock::new(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                result: TaskResult::new(),
                error: None,
                hooks: Hooks::default(),
                started_at: None,
                finished_at: None,
            }),
            signal: CancellationToken::new(),
            deadline: watch::Sender::new(None),
            exited: watch::Sender::new(false),
            created_at: Utc::now(),
        })
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Name of the job this task runs.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// When the task was dispatched.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The metadata attached at dispatch.
    pub fn get_meta(&self) -> &dyn TaskMetadata {
        self.metadata.as_ref()
    }

    /// The metadata as its concrete type, if it is an `M`.
    pub fn meta<M: TaskMetadata>(&self) -> Option<&M> {
        self.meta_any.downcast_ref::<M>()
    }

    /// Result projection used to seed subscribers that attach mid-job.
    pub fn initial_result(&self) -> TaskResult {
        self.metadata.format_to_result()
    }

    /// The pool this task was dispatched into, while it is alive.
    pub fn pool(&self) -> Option<Arc<TaskPool>> {
        self.pool.upgrade()
    }

    /// Identifier of the pool this task was dispatched into.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The pool holding this task's decomposed sub-work, if any.
    pub fn child_task_pool(&self) -> Option<Arc<TaskPool>> {
        self.child_pool.get().cloned()
    }

    /// Associate the pool holding this task's sub-work. May be set once.
    pub fn set_child_task_pool(&self, pool: Arc<TaskPool>) -> Result<(), TaskServiceError> {
        self.child_pool
            .set(pool)
            .map_err(|_| TaskServiceError::ChildPoolAlreadySet(self.id))
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// Whether the task has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    /// The error recorded when the task ended in `Error`.
    pub fn read_error(&self) -> Option<TaskError> {
        self.state().error.clone()
    }

    /// Time spent running, once the task has started.
    pub fn execution_time(&self) -> Option<Duration> {
        let state = self.state();
        let started = state.started_at?;
        let end = state.finished_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }

    // ── Results ──────────────────────────────────────────────────

    /// Merge `partial` into the cumulative result and notify the result hook
    /// with the full merged result.
    pub fn set_result(&self, partial: impl Into<TaskResult>) {
        let (merged, hook) = {
            let mut state = self.state();
            state.result.merge(partial.into());
            (state.result.clone(), state.hooks.on_result.clone())
        };

        if let Some(hook) = hook {
            hook(&merged);
        }
    }

    /// The cumulative result.
    pub fn get_results(&self) -> TaskResult {
        self.state().result.clone()
    }

    /// A single value from the cumulative result.
    pub fn get_result(&self, key: &str) -> Option<Value> {
        self.state().result.get(key).cloned()
    }

    // ── Hooks ────────────────────────────────────────────────────

    /// Register the callback run on every result update, replacing any
    /// previous one.
    pub fn on_result(&self, hook: impl Fn(&TaskResult) + Send + Sync + 'static) {
        self.state().hooks.on_result = Some(Arc::new(hook));
    }

    /// Detach the result callback.
    pub fn clear_on_result(&self) {
        self.state().hooks.on_result = None;
    }

    /// Register a callback run with the final result once the task succeeds.
    /// Runs immediately if the task has already succeeded.
    pub fn set_post_action(&self, action: impl FnOnce(&TaskResult) + Send + 'static) {
        let mut state = self.state();
        match state.status {
            TaskStatus::Success => {
                let result = state.result.clone();
                drop(state);
                action(&result);
            }
            status if status.is_terminal() => {}
            _ => state.hooks.post_action = Some(Box::new(action)),
        }
    }

    /// Register the cleanup run when the task succeeds. Ignored once the task
    /// has reached a terminal status.
    pub fn set_cleanup(&self, cleanup: impl FnOnce(&Task) + Send + 'static) {
        let mut state = self.state();
        if !state.status.is_terminal() {
            state.hooks.cleanup = Some(Box::new(cleanup));
        }
    }

    /// Register the cleanup run when the task errors or is canceled. Ignored
    /// once the task has reached a terminal status.
    pub fn set_error_cleanup(&self, cleanup: impl FnOnce(&Task) + Send + 'static) {
        let mut state = self.state();
        if !state.status.is_terminal() {
            state.hooks.error_cleanup = Some(Box::new(cleanup));
        }
    }

    // ── Terminal transitions ─────────────────────────────────────

    /// Mark the task successful. No-op if already terminal.
    pub fn success(&self) {
        self.settle(TaskStatus::Success, None);
    }

    /// Mark the task successful, logging `msg`.
    pub fn success_msg(&self, msg: impl fmt::Display) {
        if self.settle(TaskStatus::Success, None) {
            tracing::info!("Task {} [{}] succeeded: {}", self.id, self.job_name, msg);
        }
    }

    /// Record `err` and end the task in `Error`. The returned sentinel must be
    /// propagated out of the job function.
    pub fn fail(&self, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> TaskExit {
        self.fail_with(TaskError::job(err))
    }

    /// Record a pre-built [`TaskError`] and end the task in `Error`.
    pub fn fail_with(&self, err: TaskError) -> TaskExit {
        self.settle(TaskStatus::Error, Some(err));
        TaskExit::Failed
    }

    /// Like [`fail`](Self::fail), prefixing the error with `msg`.
    pub fn error_and_exit(
        &self,
        err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        msg: &str,
    ) -> TaskExit {
        let err = err.into();
        if msg.is_empty() {
            self.fail(err)
        } else {
            self.fail(format!("{msg}: {err}"))
        }
    }

    /// Pass `Ok` values through; fail the task on `Err`.
    pub fn req_no_err<T, E>(&self, res: Result<T, E>) -> Result<T, TaskExit>
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        res.map_err(|err| self.fail(err))
    }

    // ── Cancellation & timeouts ──────────────────────────────────

    /// Request cooperative cancellation. Tasks that have not started settle
    /// directly into `Canceled`; running tasks settle once they next check.
    /// The request is forwarded into the child pool.
    pub fn cancel(&self) {
        if self.signal.is_cancelled() || self.is_complete() {
            return;
        }

        tracing::trace!("Cancelling task {} [{}]", self.id, self.job_name);
        self.signal.cancel();
        self.settle_inner(TaskStatus::Canceled, None, true);

        if let Some(child) = self.child_pool.get() {
            child.cancel();
        }
    }

    /// Whether cancellation has been requested. Never unwinds, so it is safe
    /// inside cleanup code.
    pub fn check_exit(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Leave the job if cancellation has been requested, settling the task in
    /// `Canceled` and running its error cleanup.
    pub fn exit_if_signaled(&self) -> Result<(), TaskExit> {
        if self.check_exit() {
            self.settle(TaskStatus::Canceled, None);
            return Err(TaskExit::Canceled);
        }
        Ok(())
    }

    /// Resolves when cancellation is requested. Combine it with other wait
    /// points in `tokio::select!` so cancellation stays effective.
    pub fn signaled(&self) -> WaitForCancellationFuture<'_> {
        self.signal.cancelled()
    }

    /// Arm the watchdog, replacing any previous deadline.
    pub fn set_timeout(&self, deadline: Instant) {
        self.deadline.send_replace(Some(deadline));
    }

    /// Disarm the watchdog.
    pub fn clear_timeout(&self) {
        self.deadline.send_replace(None);
    }

    // ── Observers ────────────────────────────────────────────────

    /// Wait until the task has reached a terminal status and its hooks have
    /// run.
    pub async fn wait(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Wait on this task's child pool while staying cancellable. Returns
    /// immediately when no child pool was set.
    pub async fn wait_child_pool(&self, include_child_pools: bool) -> Result<(), TaskExit> {
        let Some(pool) = self.child_task_pool() else {
            return Ok(());
        };

        tokio::select! {
            _ = pool.wait(include_child_pools) => Ok(()),
            _ = self.signal.cancelled() => {
                self.settle(TaskStatus::Canceled, None);
                Err(TaskExit::Canceled)
            }
        }
    }

    /// Serializable view for subscribers.
    pub fn snapshot(&self) -> TaskSnapshot {
        let execution_time = self.execution_time();
        let state = self.state();
        TaskSnapshot {
            task_id: self.id,
            job_name: self.job_name.clone(),
            status: state.status,
            result: state.result.clone(),
            error: state.error.as_ref().map(|e| e.to_string()),
            pool_id: Some(self.pool_id),
            execution_time,
        }
    }

    // ── Worker-facing internals ──────────────────────────────────

    pub(crate) fn mark_queued(&self) {
        let mut state = self.state();
        if state.status == TaskStatus::Created {
            state.status = TaskStatus::Queued;
        }
    }

    /// Move from `Queued` to `Running`. Returns false when the task was
    /// settled (canceled) before a worker picked it up.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }
        state.status = TaskStatus::Running;
        state.started_at = Some(Instant::now());
        true
    }

    /// Settle a task whose job function returned.
    pub(crate) fn finish(&self, outcome: Result<(), TaskExit>) {
        match outcome {
            Ok(()) => {
                self.settle(TaskStatus::Success, None);
            }
            Err(TaskExit::Canceled) => {
                self.settle(TaskStatus::Canceled, None);
            }
            Err(TaskExit::Failed) => {
                self.settle(
                    TaskStatus::Error,
                    Some(TaskError::job("job exited without recording an error")),
                );
            }
        }
    }

    /// Resolves when the armed deadline passes. Re-arms whenever the
    /// deadline is replaced or cleared.
    pub(crate) async fn watchdog(&self) {
        let mut rx = self.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    /// Settle the task after its deadline elapsed.
    pub(crate) fn time_out(&self) {
        if self.settle(TaskStatus::Error, Some(TaskError::Timeout)) {
            tracing::warn!("Task {} [{}] timed out", self.id, self.job_name);
        }
        if let Some(child) = self.child_pool.get() {
            child.cancel();
        }
    }

    fn settle(&self, status: TaskStatus, error: Option<TaskError>) -> bool {
        self.settle_inner(status, error, false)
    }

    /// Move to a terminal status exactly once. Hooks run and the owning pool
    /// is updated before waiters wake.
    fn settle_inner(
        &self,
        status: TaskStatus,
        error: Option<TaskError>,
        only_if_unstarted: bool,
    ) -> bool {
        let (post_action, cleanup, result) = {
            let mut state = self.state();
            if state.status.is_terminal() {
                return false;
            }
            if only_if_unstarted && state.status == TaskStatus::Running {
                return false;
            }

            state.status = status;
            state.error = error.clone();
            state.finished_at = Some(Instant::now());

            let post_action = state.hooks.post_action.take();
            let cleanup = state.hooks.cleanup.take();
            let error_cleanup = state.hooks.error_cleanup.take();
            let (post_action, cleanup) = if status == TaskStatus::Success {
                (post_action, cleanup)
            } else {
                (None, error_cleanup)
            };
            (post_action, cleanup, state.result.clone())
        };

        match &error {
            Some(err) => tracing::error!(
                "Task {} [{}] exited with error: {}",
                self.id,
                self.job_name,
                err
            ),
            None => tracing::debug!(
                "Task {} [{}] exited with status {}",
                self.id,
                self.job_name,
                status
            ),
        }

        if let Some(action) = post_action {
            if catch_unwind(AssertUnwindSafe(|| action(&result))).is_err() {
                tracing::error!("Post action of task {} panicked", self.id);
            }
        }
        if let Some(cleanup) = cleanup {
            if catch_unwind(AssertUnwindSafe(|| cleanup(self))).is_err() {
                tracing::error!("Cleanup of task {} panicked", self.id);
            }
        }

        // No further sub-work can be queued once the owner has settled.
        if let Some(child) = self.child_pool.get() {
            child.close();
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.task_exited(self, status, error);
        }

        self.exited.send_replace(true);
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("job_name", &self.job_name)
            .field("status", &self.status())
            .field("pool_id", &self.pool_id)
            .finish()
    }
}
