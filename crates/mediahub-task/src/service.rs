//! Task service — owns the worker loops and dispatches jobs to them.
//!
//! The service holds the job registry and the global pool. A shared queue
//! feeds a fixed number of long-lived worker loops. A task occupies one
//! worker for its whole execution, including time spent idling on external
//! input or waiting on its child pool.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing;

use mediahub_core::config::TaskWorkerConfig;
use mediahub_core::types::{PoolId, TaskId};

use crate::error::{TaskError, TaskServiceError};
use crate::metadata::TaskMetadata;
use crate::pool::TaskPool;
use crate::registry::JobRegistry;
use crate::status::WorkerPoolStatus;
use crate::task::Task;

type TaskQueue = Arc<AsyncMutex<mpsc::UnboundedReceiver<Arc<Task>>>>;

struct ServiceInner {
    registry: JobRegistry,
    config: TaskWorkerConfig,
    worker_count: usize,
    global_pool: Arc<TaskPool>,
    tasks: DashMap<TaskId, Arc<Task>>,
    pools: DashMap<PoolId, Weak<TaskPool>>,
    queue_tx: mpsc::UnboundedSender<Arc<Task>>,
    queue_rx: TaskQueue,
    queued: AtomicUsize,
    lifetime_queued: AtomicU64,
    busy: AtomicUsize,
    live_workers: AtomicUsize,
    started: AtomicBool,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Dispatcher and worker pool for all jobs in the process.
///
/// Cheap to clone; every clone refers to the same engine.
#[derive(Clone)]
pub struct TaskService {
    inner: Arc<ServiceInner>,
}

impl TaskService {
    /// Create a service with a fixed job registry. Workers do not start until
    /// [`run`](Self::run) is called, but dispatching before then is allowed.
    pub fn new(config: TaskWorkerConfig, registry: JobRegistry) -> Self {
        let worker_count = config.effective_workers();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let global_pool = TaskPool::new(true, None);
        tracing::info!(
            "Created task service with {} workers, global pool {}",
            worker_count,
            global_pool.id()
        );

        Self {
            inner: Arc::new(ServiceInner {
                registry,
                config,
                worker_count,
                global_pool,
                tasks: DashMap::new(),
                pools: DashMap::new(),
                queue_tx,
                queue_rx: Arc::new(AsyncMutex::new(queue_rx)),
                queued: AtomicUsize::new(0),
                lifetime_queued: AtomicU64::new(0),
                busy: AtomicUsize::new(0),
                live_workers: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                shutdown_tx: watch::Sender::new(false),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the worker loops and the status reporter onto the current tokio
    /// runtime. The service cannot be restarted; later calls are ignored.
    pub fn run(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Task service is already running");
            return;
        }

        let mut handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for worker_id in 0..self.inner.worker_count {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown_tx.subscribe();
            handles.push(tokio::spawn(worker_loop(inner, worker_id, shutdown)));
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        handles.push(tokio::spawn(status_reporter(inner, shutdown)));

        tracing::info!(
            "Task service started with {} workers",
            self.inner.worker_count
        );
    }

    /// Create a task for `job_name`, add it to `pool` (or the global pool),
    /// and queue it for execution.
    ///
    /// The returned task can be waited on, observed, or canceled immediately,
    /// even before a worker has picked it up.
    pub fn dispatch_job<M: TaskMetadata>(
        &self,
        job_name: &str,
        metadata: M,
        pool: Option<&Arc<TaskPool>>,
    ) -> Result<Arc<Task>, TaskServiceError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(TaskServiceError::ShuttingDown);
        }
        if !self.inner.registry.has_handler(job_name) {
            return Err(TaskServiceError::UnknownJob(job_name.to_string()));
        }
        if metadata.job_name() != job_name {
            return Err(TaskServiceError::JobNameMismatch {
                dispatched: job_name.to_string(),
                metadata: metadata.job_name().to_string(),
            });
        }
        metadata
            .verify()
            .map_err(|source| TaskServiceError::InvalidMetadata {
                job: job_name.to_string(),
                source,
            })?;

        let pool = pool.unwrap_or(&self.inner.global_pool);
        let task = Task::new(TaskId::new(), metadata, pool);
        pool.add(Arc::clone(&task))?;
        task.mark_queued();

        self.inner.tasks.insert(task.id(), Arc::clone(&task));
        self.inner.lifetime_queued.fetch_add(1, Ordering::Relaxed);
        self.inner.queued.fetch_add(1, Ordering::SeqCst);

        if self.inner.queue_tx.send(Arc::clone(&task)).is_err() {
            self.inner.tasks.remove(&task.id());
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            task.cancel();
            return Err(TaskServiceError::ShuttingDown);
        }

        tracing::debug!(
            "Queued task {} [{}] in pool {}: {}",
            task.id(),
            job_name,
            pool.id(),
            task.get_meta().meta_string()
        );

        Ok(task)
    }

    /// Create a free-standing pool, or one owned by `created_by`.
    pub fn new_task_pool(&self, created_by: Option<&Arc<Task>>) -> Arc<TaskPool> {
        let pool = TaskPool::new(false, created_by);
        self.inner.pools.insert(pool.id(), Arc::downgrade(&pool));
        pool
    }

    /// Create a pool for `task`'s sub-work and record it as its child pool.
    pub fn new_child_pool(&self, task: &Arc<Task>) -> Result<Arc<TaskPool>, TaskServiceError> {
        let pool = self.new_task_pool(Some(task));
        task.set_child_task_pool(Arc::clone(&pool))?;
        Ok(pool)
    }

    /// The process-wide default pool.
    pub fn global_pool(&self) -> Arc<TaskPool> {
        Arc::clone(&self.inner.global_pool)
    }

    /// Look up an in-flight task.
    pub fn get_task(&self, task_id: TaskId) -> Option<Arc<Task>> {
        self.inner.tasks.get(&task_id).map(|t| Arc::clone(t.value()))
    }

    /// Look up a live pool. A stale entry found on the way is dropped.
    pub fn get_task_pool(&self, pool_id: PoolId) -> Option<Arc<TaskPool>> {
        if pool_id == self.inner.global_pool.id() {
            return Some(self.global_pool());
        }
        let found = self.inner.pools.get(&pool_id).map(|p| p.upgrade())?;
        if found.is_none() {
            self.inner
                .pools
                .remove_if(&pool_id, |_, p| p.strong_count() == 0);
        }
        found
    }

    /// Find a live pool created by a task of `job_name`.
    pub fn get_task_pool_by_job_name(&self, job_name: &str) -> Option<Arc<TaskPool>> {
        self.inner
            .pools
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .find(|pool| {
                pool.created_in_task()
                    .is_some_and(|task| task.job_name() == job_name)
            })
    }

    /// Number of worker loops this service runs.
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Counters describing the worker pool.
    pub fn status(&self) -> WorkerPoolStatus {
        self.inner.status()
    }

    /// Stop accepting work and wait for in-flight jobs up to the configured
    /// grace period. Tasks still queued are canceled.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Task service shutting down, waiting for in-flight jobs...");
        self.inner.shutdown_tx.send_replace(true);

        let handles = std::mem::take(
            &mut *self
                .inner
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let grace = Duration::from_secs(self.inner.config.shutdown_grace_seconds);
        if time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                "Task service shutdown timed out after {}s with {} busy workers",
                grace.as_secs(),
                self.inner.busy.load(Ordering::SeqCst)
            );
        }

        let mut canceled = 0;
        if let Ok(mut rx) = self.inner.queue_rx.try_lock() {
            while let Ok(task) = rx.try_recv() {
                self.inner.queued.fetch_sub(1, Ordering::SeqCst);
                self.inner.tasks.remove(&task.id());
                task.cancel();
                canceled += 1;
            }
        }

        tracing::info!(
            "Task service shut down complete ({} queued tasks canceled)",
            canceled
        );
    }
}

impl fmt::Debug for TaskService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskService")
            .field("workers", &self.inner.worker_count)
            .field("jobs", &self.inner.registry.registered_jobs())
            .field("status", &self.inner.status())
            .finish()
    }
}

impl ServiceInner {
    /// Forget pools nobody holds any more.
    fn prune_pools(&self) -> usize {
        let before = self.pools.len();
        self.pools.retain(|_, p| p.strong_count() > 0);
        before.saturating_sub(self.pools.len())
    }

    fn status(&self) -> WorkerPoolStatus {
        WorkerPoolStatus {
            queued: self.queued.load(Ordering::SeqCst),
            lifetime_queued: self.lifetime_queued.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::SeqCst),
            workers: self.live_workers.load(Ordering::SeqCst),
        }
    }
}

/// Pull tasks from the shared queue until shutdown is signalled.
async fn worker_loop(inner: Arc<ServiceInner>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    inner.live_workers.fetch_add(1, Ordering::SeqCst);
    tracing::debug!("Worker {} started", worker_id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => continue,
            task = async { inner.queue_rx.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };
        inner.queued.fetch_sub(1, Ordering::SeqCst);

        execute(&inner, worker_id, task).await;
    }

    inner.live_workers.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!("Worker {} stopped", worker_id);
}

/// Run one task to completion on this worker, containing panics and racing
/// the job against the task's watchdog.
async fn execute(inner: &Arc<ServiceInner>, worker_id: usize, task: Arc<Task>) {
    if !task.begin() {
        tracing::debug!(
            "Worker {} skipping task {} [{}]: already {}",
            worker_id,
            task.id(),
            task.job_name(),
            task.status()
        );
        inner.tasks.remove(&task.id());
        return;
    }

    let Some(handler) = inner.registry.get(task.job_name()) else {
        let _ = task.fail(format!("no handler registered for job '{}'", task.job_name()));
        inner.tasks.remove(&task.id());
        return;
    };

    if let Some(pool) = task.pool() {
        pool.task_started();
    }

    inner.busy.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(
        "Worker {} starting task {} [{}]",
        worker_id,
        task.id(),
        task.job_name()
    );

    let service = TaskService {
        inner: Arc::clone(inner),
    };
    let job = AssertUnwindSafe(handler.run(Arc::clone(&task), service)).catch_unwind();

    tokio::select! {
        outcome = job => match outcome {
            Ok(result) => task.finish(result),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(
                    "Worker {} recovered panic in task {} [{}]: {}",
                    worker_id,
                    task.id(),
                    task.job_name(),
                    msg
                );
                let _ = task.fail_with(TaskError::Panicked(msg));
            }
        },
        _ = task.watchdog() => {
            tracing::warn!("Sending timeout signal to task {} [{}]", task.id(), task.job_name());
            task.time_out();
        }
    }

    inner.busy.fetch_sub(1, Ordering::SeqCst);
    inner.tasks.remove(&task.id());

    tracing::debug!(
        "Worker {} finished task {} [{}] with status {} in {:?}",
        worker_id,
        task.id(),
        task.job_name(),
        task.status(),
        task.execution_time().unwrap_or_default()
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Log worker pool status whenever it changes, backing off while idle.
async fn status_reporter(inner: Arc<ServiceInner>, mut shutdown: watch::Receiver<bool>) {
    let max_wait = Duration::from_secs(inner.config.status_report_interval_seconds.max(1));
    let mut wait = Duration::from_secs(1);
    let mut last: Option<WorkerPoolStatus> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(wait) => {}
        }

        let pruned = inner.prune_pools();
        if pruned > 0 {
            tracing::trace!("Pruned {} released task pools", pruned);
        }

        let status = inner.status();
        if last != Some(status) {
            tracing::info!(
                "Task worker pool status: Queued[{}]/Total[{}], Busy[{}], Alive[{}]",
                status.queued,
                status.lifetime_queued,
                status.busy,
                status.workers
            );
            last = Some(status);
            wait = Duration::from_secs(1);
        } else if wait < max_wait {
            wait += Duration::from_secs(1);
        }
    }
}
