//! Task pools: bookkeeping groups of tasks with aggregate progress.
//!
//! A pool is not an execution resource. Every pool shares the service's
//! workers; the pool only tracks which tasks belong to one conceptual job so
//! callers can wait on or cancel that job as a whole.
//! Pools nest through the tasks that create them, forming a tree rooted at
//! the global pool.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing;

use mediahub_core::types::{PoolId, TaskId};

use crate::error::{TaskError, TaskServiceError};
use crate::status::{PoolStatus, TaskStatus};
use crate::task::Task;

type PoolCleanup = Box<dyn FnOnce(&TaskPool) + Send>;

struct PoolInner {
    tasks: Vec<Arc<Task>>,
    total: usize,
    complete: usize,
    failed: usize,
    errors: Vec<TaskError>,
    all_queued: bool,
    first_started: Option<Instant>,
    converged_at: Option<Instant>,
    cleanups: Vec<PoolCleanup>,
}

/// A group of tasks dispatched as one conceptual job.
pub struct TaskPool {
    id: PoolId,
    global: bool,
    created_by: Option<Weak<Task>>,
    created_by_id: Option<TaskId>,
    created_at: DateTime<Utc>,
    inner: Mutex<PoolInner>,
    converged: watch::Sender<bool>,
}

impl TaskPool {
    pub(crate) fn new(global: bool, created_by: Option<&Arc<Task>>) -> Arc<Self> {
        Arc::new(Self {
            id: PoolId::new(),
            global,
            created_by: created_by.map(Arc::downgrade),
            created_by_id: created_by.map(|t| t.id()),
            created_at: Utc::now(),
            inner: Mutex::new(PoolInner {
                tasks: Vec::new(),
                total: 0,
                complete: 0,
                failed: 0,
                errors: Vec::new(),
                all_queued: false,
                first_started: None,
                converged_at: None,
                cleanups: Vec::new(),
            }),
            converged: watch::Sender::new(false),
        })
    }

    fn inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool identifier.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// When the pool was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether this is the process-wide default pool.
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// The task that spawned this pool for its sub-work, while alive.
    pub fn created_in_task(&self) -> Option<Arc<Task>> {
        self.created_by.as_ref().and_then(Weak::upgrade)
    }

    /// Identifier of the task that spawned this pool.
    pub fn created_in_task_id(&self) -> Option<TaskId> {
        self.created_by_id
    }

    /// The pool holding the task that created this one, unless that is the
    /// global pool.
    fn parent_pool(&self) -> Option<Arc<TaskPool>> {
        self.created_in_task()
            .and_then(|task| task.pool())
            .filter(|pool| !pool.is_global())
    }

    /// Whether no non-global pool sits above this one.
    pub fn is_root(&self) -> bool {
        self.parent_pool().is_none()
    }

    /// The top-most non-global ancestor, reached by climbing
    /// "created by task X, which belongs to pool Y".
    pub fn root_pool(self: &Arc<Self>) -> Arc<TaskPool> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent_pool() {
            current = parent;
        }
        current
    }

    /// Every task ever added (terminal tasks are pruned from the global pool).
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.inner().tasks.clone()
    }

    /// Child pools spawned by tasks in this pool.
    pub fn child_pools(&self) -> Vec<Arc<TaskPool>> {
        self.inner()
            .tasks
            .iter()
            .filter_map(|task| task.child_task_pool())
            .collect()
    }

    pub(crate) fn add(&self, task: Arc<Task>) -> Result<(), TaskServiceError> {
        let mut inner = self.inner();
        if inner.all_queued {
            return Err(TaskServiceError::PoolClosed(self.id));
        }
        inner.tasks.push(task);
        inner.total += 1;
        Ok(())
    }

    pub(crate) fn task_started(&self) {
        self.inner().first_started.get_or_insert_with(Instant::now);
    }

    pub(crate) fn task_exited(&self, task: &Task, status: TaskStatus, error: Option<TaskError>) {
        let cleanups = {
            let mut inner = self.inner();
            inner.complete += 1;
            if status == TaskStatus::Error {
                inner.failed += 1;
                // Global pool keeps a count only.
                if let Some(err) = error.filter(|_| !self.global) {
                    inner.errors.push(err);
                }
            }
            if self.global {
                inner.tasks.retain(|t| t.id() != task.id());
            }
            self.converge(&mut inner)
        };

        if let Some(cleanups) = cleanups {
            self.finish(cleanups);
        }
    }

    /// Close the pool once its creating task has settled. No-op if already
    /// closed.
    pub(crate) fn close(&self) {
        let cleanups = {
            let mut inner = self.inner();
            if inner.all_queued {
                return;
            }
            tracing::debug!(
                "Closing task pool {} after its creating task exited",
                self.id
            );
            inner.all_queued = true;
            self.converge(&mut inner)
        };

        if let Some(cleanups) = cleanups {
            self.finish(cleanups);
        }
    }

    /// Declare that no further tasks will be added, freezing `total`.
    pub fn signal_all_queued(&self) {
        if self.global {
            tracing::error!("Attempt to signal all queued on the global task pool");
            return;
        }

        let cleanups = {
            let mut inner = self.inner();
            if inner.all_queued {
                tracing::warn!("Task pool {} was already signalled all queued", self.id);
                return;
            }
            inner.all_queued = true;
            self.converge(&mut inner)
        };

        if let Some(cleanups) = cleanups {
            self.finish(cleanups);
        }
    }

    /// Whether `signal_all_queued` (or `cancel`) has closed the pool.
    pub fn is_all_queued(&self) -> bool {
        self.inner().all_queued
    }

    /// Mark the pool converged if every queued task is terminal. Returns the
    /// cleanups to run once the lock is released.
    fn converge(&self, inner: &mut PoolInner) -> Option<Vec<PoolCleanup>> {
        if self.global
            || !inner.all_queued
            || inner.complete < inner.total
            || inner.converged_at.is_some()
        {
            return None;
        }
        inner.converged_at = Some(Instant::now());
        Some(std::mem::take(&mut inner.cleanups))
    }

    fn finish(&self, cleanups: Vec<PoolCleanup>) {
        tracing::trace!("Task pool {} complete, waking waiters", self.id);
        self.converged.send_replace(true);
        for cleanup in cleanups {
            self.run_cleanup(cleanup);
        }
    }

    fn run_cleanup(&self, cleanup: PoolCleanup) {
        if catch_unwind(AssertUnwindSafe(|| cleanup(self))).is_err() {
            tracing::error!("Failed to execute cleanup of task pool {}", self.id);
        }
    }

    /// Register a callback run once the pool converges. Callbacks run in
    /// registration order; one added after convergence runs immediately.
    pub fn add_cleanup(&self, cleanup: impl FnOnce(&TaskPool) + Send + 'static) {
        let mut inner = self.inner();
        if inner.converged_at.is_some() {
            drop(inner);
            self.run_cleanup(Box::new(cleanup));
            return;
        }
        inner.cleanups.push(Box::new(cleanup));
    }

    /// Wait until every task in the pool is terminal and the pool has been
    /// signalled all queued. With `include_child_pools`, also waits on every
    /// child pool spawned by those tasks, transitively.
    ///
    /// The global pool never converges; waiting on it returns immediately.
    pub async fn wait(&self, include_child_pools: bool) {
        if self.global {
            return;
        }
        self.wait_converged().await;
        if !include_child_pools {
            return;
        }

        let mut pending = self.child_pools();
        while let Some(pool) = pending.pop() {
            pool.wait_converged().await;
            pending.extend(pool.child_pools());
        }
    }

    async fn wait_converged(&self) {
        if !self.is_all_queued() {
            tracing::warn!(
                "Waiting on task pool {} before all tasks were queued; this may never wake up",
                self.id
            );
        }
        let mut rx = self.converged.subscribe();
        let _ = rx.wait_for(|converged| *converged).await;
    }

    /// Request cancellation of every task in the pool and its child pools.
    /// Closes the pool to further tasks. Idempotent.
    pub fn cancel(&self) {
        let (tasks, cleanups) = {
            let mut inner = self.inner();
            if !self.global {
                inner.all_queued = true;
            }
            let cleanups = self.converge(&mut inner);
            (inner.tasks.clone(), cleanups)
        };

        if let Some(cleanups) = cleanups {
            self.finish(cleanups);
        }

        for task in tasks {
            task.cancel();
            if let Some(child) = task.child_task_pool() {
                child.cancel();
            }
        }
    }

    /// Errors recorded by tasks in this pool that ended in `Error`. The
    /// global pool keeps only a count, reported as [`PoolStatus::failed`].
    pub fn errors(&self) -> Vec<TaskError> {
        self.inner().errors.clone()
    }

    /// Tasks in this pool that ended in `Error`.
    pub fn failed_tasks(&self) -> Vec<Arc<Task>> {
        self.inner()
            .tasks
            .iter()
            .filter(|task| task.status() == TaskStatus::Error)
            .cloned()
            .collect()
    }

    /// Point-in-time progress of this pool's own tasks.
    pub fn status(&self) -> PoolStatus {
        let inner = self.inner();
        PoolStatus::new(
            inner.complete,
            inner.failed,
            inner.total,
            inner.all_queued,
            Self::runtime(&inner),
        )
    }

    /// Progress summed across this pool and, transitively, its child pools.
    pub fn deep_status(&self) -> PoolStatus {
        let own = self.status();
        let (mut complete, mut failed, mut total) = (own.complete, own.failed, own.total);
        let mut all_queued = self.is_all_queued();

        let mut pending = self.child_pools();
        while let Some(pool) = pending.pop() {
            let status = pool.status();
            complete += status.complete;
            failed += status.failed;
            total += status.total;
            all_queued &= pool.is_all_queued();
            pending.extend(pool.child_pools());
        }

        PoolStatus::new(complete, failed, total, all_queued, own.runtime)
    }

    fn runtime(inner: &PoolInner) -> Duration {
        match inner.first_started {
            Some(started) => inner
                .converged_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(started),
            None => Duration::ZERO,
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("id", &self.id)
            .field("global", &self.global)
            .field("created_by", &self.created_by_id)
            .field("status", &self.status())
            .finish()
    }
}
