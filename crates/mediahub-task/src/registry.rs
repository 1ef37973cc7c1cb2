//! Job registry: maps job names to the functions that run them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing;

use crate::error::TaskExit;
use crate::service::TaskService;
use crate::task::Task;

/// Trait for job function implementations
#[async_trait]
pub trait JobHandler: Send + Sync + fmt::Debug {
    /// Get the job name this handler runs
    fn job_name(&self) -> &str;

    /// Run the job with the task as its handle.
    ///
    /// Returning `Ok(())` without settling the task marks it successful.
    /// `Err(TaskExit)` is produced by the task's own terminal methods and only
    /// needs to be propagated.
    async fn run(&self, task: Arc<Task>, service: TaskService) -> Result<(), TaskExit>;
}

/// Adapter that lets a plain async closure act as a [`JobHandler`].
struct FnJobHandler<F> {
    name: String,
    func: F,
}

impl<F> fmt::Debug for FnJobHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJobHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(Arc<Task>, TaskService) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskExit>> + Send + 'static,
{
    fn job_name(&self) -> &str {
        &self.name
    }

    async fn run(&self, task: Arc<Task>, service: TaskService) -> Result<(), TaskExit> {
        (self.func)(task, service).await
    }
}

/// Registered job handlers by name.
///
/// Populated once during process initialization and handed to the
/// [`TaskService`], which only reads it afterwards.
#[derive(Debug, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler, replacing any handler with the same name
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_name = handler.job_name().to_string();
        tracing::info!("Registered job handler for '{}'", job_name);
        self.handlers.insert(job_name, handler);
    }

    /// Register an async closure as the job function for `name`
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Arc<Task>, TaskService) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskExit>> + Send + 'static,
    {
        self.register(Arc::new(FnJobHandler {
            name: name.into(),
            func,
        }));
    }

    /// Look up the handler for a job name
    pub fn get(&self, job_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_name).cloned()
    }

    /// Check if a handler is registered for a job name
    pub fn has_handler(&self, job_name: &str) -> bool {
        self.handlers.contains_key(job_name)
    }

    /// Get the list of registered job names
    pub fn registered_jobs(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}
