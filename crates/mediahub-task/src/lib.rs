//! Hierarchical, cancellable task scheduling for MediaHub.
//!
//! This crate provides:
//! - A task service that dispatches named jobs onto a fixed set of workers
//! - Tasks with incremental results, cooperative cancellation and watchdog timeouts
//! - Task pools that aggregate progress and nest through the tasks that
//!   create them
//! - A job registry mapping job names to the functions that run them

pub mod error;
pub mod metadata;
pub mod pool;
pub mod registry;
pub mod result;
pub mod service;
pub mod status;
pub mod task;

pub use error::{TaskError, TaskExit, TaskServiceError};
pub use metadata::TaskMetadata;
pub use pool::TaskPool;
pub use registry::{JobHandler, JobRegistry};
pub use result::TaskResult;
pub use service::TaskService;
pub use status::{PoolStatus, TaskSnapshot, TaskStatus, WorkerPoolStatus};
pub use task::Task;
