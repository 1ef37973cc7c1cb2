//! Integration tests for watchdog timeouts.

mod helpers;

use std::time::Duration;

use helpers::{SimpleMeta, within};
use mediahub_task::{TaskError, TaskStatus};

#[tokio::test]
async fn test_stalled_task_times_out() {
    let service = helpers::start_service(2);

    let started = tokio::time::Instant::now();
    let task = service
        .dispatch_job("stall", SimpleMeta::new("stall"), None)
        .expect("dispatch");
    within(task.wait()).await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(task.status(), TaskStatus::Error);
    assert!(task.read_error().is_some_and(|e| e.is_timeout()));

    // The worker is released for the next job.
    let next = service
        .dispatch_job("noop", SimpleMeta::new("noop"), None)
        .expect("dispatch");
    within(next.wait()).await;
    assert_eq!(next.status(), TaskStatus::Success);

    service.shutdown().await;
}

#[tokio::test]
async fn test_cleared_timeout_lets_task_finish() {
    let service = helpers::start_service(1);

    let task = service
        .dispatch_job("disarm", SimpleMeta::new("disarm"), None)
        .expect("dispatch");
    within(task.wait()).await;

    assert_eq!(task.status(), TaskStatus::Success);
    assert!(task.read_error().is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn test_timeout_counts_as_pool_error() {
    let service = helpers::start_service(2);
    let pool = service.new_task_pool(None);

    let cleaned = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let task = service
        .dispatch_job("stall", SimpleMeta::new("stall"), Some(&pool))
        .expect("dispatch");
    let flag = std::sync::Arc::clone(&cleaned);
    task.set_error_cleanup(move |_| flag.store(true, std::sync::atomic::Ordering::SeqCst));
    pool.signal_all_queued();

    within(pool.wait(false)).await;

    assert!(matches!(pool.errors().as_slice(), [TaskError::Timeout]));
    assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));

    service.shutdown().await;
}
