//! Capability set every job's metadata implements.

use std::any::Any;
use std::fmt::Debug;

use mediahub_core::error::AppError;

use crate::result::TaskResult;

/// Metadata attached to a task at dispatch.
///
/// Each job type supplies its own struct. Job functions recover the concrete
/// type with [`Task::meta`](crate::task::Task::meta).
pub trait TaskMetadata: Any + Send + Sync + Debug {
    /// Name of the job this metadata is for.
    fn job_name(&self) -> &str;

    /// Short human-readable summary used in logs.
    fn meta_string(&self) -> String;

    /// Result snapshot used to seed subscribers before the first real result.
    fn format_to_result(&self) -> TaskResult;

    /// Validate the metadata before a task is created from it.
    fn verify(&self) -> Result<(), AppError> {
        Ok(())
    }
}
