//! End-to-end job scenarios: directory scans and zip progress reporting.

mod helpers;

use std::sync::{Arc, Mutex};

use helpers::{CreateZipMeta, ScanDirectoryMeta, within};
use mediahub_task::TaskStatus;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_directory_fans_out_to_displayable_files() {
    let service = helpers::start_service(4);

    let meta = ScanDirectoryMeta {
        path: "/media/holiday".to_string(),
        entries: vec![
            "beach.jpg".to_string(),
            "notes.txt".to_string(),
            "sunset.PNG".to_string(),
            "waves.mp4".to_string(),
        ],
    };
    let task = service
        .dispatch_job("scan_directory", meta, None)
        .expect("dispatch");
    within(task.wait()).await;

    assert_eq!(task.status(), TaskStatus::Success);
    let child_pool = task.child_task_pool().expect("child pool");
    assert_eq!(child_pool.status().total, 3);
    assert!(child_pool.errors().is_empty());
    assert_eq!(task.get_result("scanned"), Some(serde_json::json!(3)));

    let mut paths: Vec<String> = child_pool
        .tasks()
        .iter()
        .filter_map(|t| t.get_result("path"))
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/media/holiday/beach.jpg",
            "/media/holiday/sunset.PNG",
            "/media/holiday/waves.mp4",
        ]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_create_zip_reports_monotonic_progress() {
    let service = helpers::idle_service(1);

    let task = service
        .dispatch_job(
            "create_zip",
            CreateZipMeta {
                bytes_total: 10_000,
                chunk: 1_500,
            },
            None,
        )
        .expect("dispatch");

    assert_eq!(
        task.initial_result().get("bytesTotal"),
        Some(&serde_json::json!(10_000))
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    task.on_result(move |result| {
        if let Some(bytes) = result.get("bytesSoFar").and_then(|v| v.as_u64()) {
            sink.lock().unwrap().push(bytes);
        }
    });

    service.run();
    within(task.wait()).await;
    assert_eq!(task.status(), TaskStatus::Success);

    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(10_000));

    let snapshot = task.snapshot();
    assert_eq!(snapshot.status, TaskStatus::Success);
    assert_eq!(snapshot.result.get("bytesSoFar"), Some(&serde_json::json!(10_000)));
    assert!(snapshot.execution_time.is_some());

    service.shutdown().await;
}
