//! Shared test helpers for task engine integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use mediahub_core::config::TaskWorkerConfig;
use mediahub_task::{
    JobRegistry, Task, TaskError, TaskExit, TaskMetadata, TaskPool, TaskResult, TaskService,
};

/// Upper bound for any wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Await `fut`, panicking if it takes longer than [`WAIT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("operation did not finish in time")
}

/// Generic metadata for jobs that need no parameters beyond a name.
#[derive(Debug, Clone)]
pub struct SimpleMeta {
    pub job: String,
}

impl SimpleMeta {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
        }
    }
}

impl TaskMetadata for SimpleMeta {
    fn job_name(&self) -> &str {
        &self.job
    }

    fn meta_string(&self) -> String {
        self.job.clone()
    }

    fn format_to_result(&self) -> TaskResult {
        TaskResult::new()
    }
}

/// Parent job that fans out into a child pool, one child failing.
#[derive(Debug, Clone)]
pub struct FanOutMeta {
    pub job: &'static str,
    pub children: usize,
    pub fail_index: Option<usize>,
}

impl TaskMetadata for FanOutMeta {
    fn job_name(&self) -> &str {
        self.job
    }

    fn meta_string(&self) -> String {
        format!("{} children", self.children)
    }

    fn format_to_result(&self) -> TaskResult {
        TaskResult::from([("children", self.children)])
    }
}

#[derive(Debug, Clone)]
pub struct ChildMeta {
    pub index: usize,
    pub fail: bool,
}

impl TaskMetadata for ChildMeta {
    fn job_name(&self) -> &str {
        "fan_out_child"
    }

    fn meta_string(&self) -> String {
        format!("child {}", self.index)
    }

    fn format_to_result(&self) -> TaskResult {
        TaskResult::from([("index", self.index)])
    }
}

#[derive(Debug, Clone)]
pub struct ScanDirectoryMeta {
    pub path: String,
    pub entries: Vec<String>,
}

impl TaskMetadata for ScanDirectoryMeta {
    fn job_name(&self) -> &str {
        "scan_directory"
    }

    fn meta_string(&self) -> String {
        format!("scan {}", self.path)
    }

    fn format_to_result(&self) -> TaskResult {
        TaskResult::from([("path", self.path.clone())])
    }

    fn verify(&self) -> Result<(), mediahub_core::AppError> {
        if self.path.is_empty() {
            return Err(mediahub_core::AppError::validation(
                "scan_directory requires a path",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScanFileMeta {
    pub path: String,
}

impl TaskMetadata for ScanFileMeta {
    fn job_name(&self) -> &str {
        "scan_file"
    }

    fn meta_string(&self) -> String {
        format!("scan file {}", self.path)
    }

    fn format_to_result(&self) -> TaskResult {
        TaskResult::from([("path", self.path.clone())])
    }
}

#[derive(Debug, Clone)]
pub struct CreateZipMeta {
    pub bytes_total: u64,
    pub chunk: u64,
}

impl TaskMetadata for CreateZipMeta {
    fn job_name(&self) -> &str {
        "create_zip"
    }

    fn meta_string(&self) -> String {
        format!("zip {} bytes", self.bytes_total)
    }

    fn format_to_result(&self) -> TaskResult {
        TaskResult::from([("bytesSoFar", 0u64), ("bytesTotal", self.bytes_total)])
    }
}

fn is_displayable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".jpg", ".jpeg", ".png", ".gif", ".mp4", ".webm"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

async fn noop(_task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    Ok(())
}

async fn always_fail(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    Err(task.fail("fail job always fails"))
}

/// Parks until canceled.
async fn block(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    task.signaled().await;
    task.exit_if_signaled()?;
    Ok(())
}

/// Arms a 50ms deadline and never returns.
async fn stall(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    task.set_timeout(Instant::now() + Duration::from_millis(50));
    std::future::pending::<()>().await;
    Ok(())
}

/// Arms a 50ms deadline, disarms it, then outlives it.
async fn disarm(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    task.set_timeout(Instant::now() + Duration::from_millis(50));
    task.clear_timeout();
    tokio::time::sleep(Duration::from_millis(150)).await;
    Ok(())
}

async fn fan_out_child(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    let Some(meta) = task.meta::<ChildMeta>().cloned() else {
        return Err(task.fail("expected child metadata"));
    };
    if meta.fail {
        return Err(task.fail(format!("child {} failed", meta.index)));
    }
    task.set_result([("index", meta.index)]);
    Ok(())
}

async fn fan_out(task: Arc<Task>, service: TaskService) -> Result<(), TaskExit> {
    let Some(meta) = task.meta::<FanOutMeta>().cloned() else {
        return Err(task.fail("expected fan out metadata"));
    };
    let pool = task.req_no_err(service.new_child_pool(&task))?;
    for index in 0..meta.children {
        let child = ChildMeta {
            index,
            fail: meta.fail_index == Some(index),
        };
        task.req_no_err(service.dispatch_job("fan_out_child", child, Some(&pool)))?;
    }
    pool.signal_all_queued();
    task.wait_child_pool(false).await?;

    let failed = pool.errors().len();
    if meta.job == "fan_out_strict" && failed > 0 {
        return Err(task.error_and_exit(
            TaskError::ChildTaskFailed { failed },
            "fan out incomplete",
        ));
    }
    task.set_result([("failed", failed)]);
    Ok(())
}

async fn scan_directory(task: Arc<Task>, service: TaskService) -> Result<(), TaskExit> {
    let Some(meta) = task.meta::<ScanDirectoryMeta>().cloned() else {
        return Err(task.fail("expected scan_directory metadata"));
    };
    let pool = task.req_no_err(service.new_child_pool(&task))?;
    for entry in meta.entries.iter().filter(|e| is_displayable(e)) {
        let file = ScanFileMeta {
            path: format!("{}/{}", meta.path, entry),
        };
        task.req_no_err(service.dispatch_job("scan_file", file, Some(&pool)))?;
    }
    pool.signal_all_queued();
    task.wait_child_pool(true).await?;
    task.set_result([("scanned", pool.status().complete)]);
    Ok(())
}

async fn scan_file(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    task.exit_if_signaled()?;
    let path = task
        .meta::<ScanFileMeta>()
        .map(|m| m.path.clone())
        .unwrap_or_default();
    task.set_result([("path", path)]);
    Ok(())
}

async fn create_zip(task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    let Some(meta) = task.meta::<CreateZipMeta>().cloned() else {
        return Err(task.fail("expected create_zip metadata"));
    };
    task.set_result([("bytesTotal", meta.bytes_total)]);
    let mut written = 0u64;
    while written < meta.bytes_total {
        task.exit_if_signaled()?;
        written = (written + meta.chunk).min(meta.bytes_total);
        task.set_result([("bytesSoFar", written)]);
        tokio::task::yield_now().await;
    }
    Ok(())
}

async fn explode(_task: Arc<Task>, _service: TaskService) -> Result<(), TaskExit> {
    let entries: Vec<u32> = Vec::new();
    let _first = entries[0];
    Ok(())
}

/// Queues two children, then fails before closing its child pool.
async fn abandon_fan_out(task: Arc<Task>, service: TaskService) -> Result<(), TaskExit> {
    let pool = task.req_no_err(service.new_child_pool(&task))?;
    for _ in 0..2 {
        task.req_no_err(service.dispatch_job("noop", SimpleMeta::new("noop"), Some(&pool)))?;
    }
    Err(task.fail("source directory vanished"))
}

/// Queues two children, then panics before closing its child pool.
async fn crash_fan_out(task: Arc<Task>, service: TaskService) -> Result<(), TaskExit> {
    let pool = task.req_no_err(service.new_child_pool(&task))?;
    let mut queued = Vec::new();
    for _ in 0..2 {
        queued.push(task.req_no_err(service.dispatch_job(
            "noop",
            SimpleMeta::new("noop"),
            Some(&pool),
        ))?);
    }
    let _third = &queued[2];
    Ok(())
}

/// Registry with every job used by the integration tests.
pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register_fn("noop", noop);
    registry.register_fn("fail", always_fail);
    registry.register_fn("block", block);
    registry.register_fn("stall", stall);
    registry.register_fn("disarm", disarm);
    registry.register_fn("fan_out_child", fan_out_child);
    registry.register_fn("fan_out_strict", fan_out);
    registry.register_fn("fan_out_lenient", fan_out);
    registry.register_fn("scan_directory", scan_directory);
    registry.register_fn("scan_file", scan_file);
    registry.register_fn("create_zip", create_zip);
    registry.register_fn("panic", explode);
    registry.register_fn("abandon_fan_out", abandon_fan_out);
    registry.register_fn("crash_fan_out", crash_fan_out);
    registry
}

/// A running service with `workers` workers and the test registry.
pub fn start_service(workers: usize) -> TaskService {
    let service = idle_service(workers);
    service.run();
    service
}

/// A service whose workers have not been started.
pub fn idle_service(workers: usize) -> TaskService {
    let config = TaskWorkerConfig {
        workers,
        status_report_interval_seconds: 1,
        shutdown_grace_seconds: 1,
    };
    TaskService::new(config, registry())
}

/// Dispatch `count` tasks of `job` into `pool`.
pub fn dispatch_many(service: &TaskService, job: &str, count: usize, pool: &Arc<TaskPool>) {
    for _ in 0..count {
        service
            .dispatch_job(job, SimpleMeta::new(job), Some(pool))
            .expect("dispatch");
    }
}
