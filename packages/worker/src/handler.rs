//! Tube handler trait and registry.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tube_core::Job;

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The job failed; it is released for a retry or buried.
    #[error("{0}")]
    Failed(String),
    /// Something downstream is saturated; stop taking jobs from this tube
    /// for the rest of the run.
    #[error("tube suspended: {0}")]
    Suspend(String),
}

impl HandlerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    pub fn suspend(reason: impl std::fmt::Display) -> Self {
        HandlerError::Suspend(reason.to_string())
    }
}

/// Result type for tube handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Future type for async tube handlers. Owns everything it needs, so it can
/// run on its own task.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// Trait for tube handlers.
///
/// Implement this trait to define how the jobs of a tube are processed.
pub trait TubeHandler: Send + Sync + 'static {
    /// Process a job.
    fn handle(&self, job: &Job) -> HandlerFuture;
}

/// Registry for tube handlers.
///
/// Maps tube names to their handlers for dynamic dispatch.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TubeHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a tube, replacing any previous one.
    pub fn register<H: TubeHandler>(&mut self, tube: impl Into<String>, handler: H) {
        self.handlers.insert(tube.into(), Arc::new(handler));
    }

    /// Register a shared handler for a tube.
    pub fn register_arc(&mut self, tube: impl Into<String>, handler: Arc<dyn TubeHandler>) {
        self.handlers.insert(tube.into(), handler);
    }

    /// Get the handler for a tube.
    pub fn get(&self, tube: &str) -> Option<Arc<dyn TubeHandler>> {
        self.handlers.get(tube).cloned()
    }

    /// Check if a handler exists for a tube.
    pub fn has_handler(&self, tube: &str) -> bool {
        self.handlers.contains_key(tube)
    }

    /// List all tubes with a handler.
    pub fn tubes(&self) -> Vec<&str> {
        let mut tubes: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        tubes.sort_unstable();
        tubes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tubes", &self.tubes())
            .finish()
    }
}

/// A simple function-based tube handler.
pub struct FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> TubeHandler for FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, job: &Job) -> HandlerFuture {
        (self.handler)(job)
    }
}

/// Logs the payload and succeeds. Registered as `handler = "log"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

impl TubeHandler for LogHandler {
    fn handle(&self, job: &Job) -> HandlerFuture {
        tracing::info!(job_id = %job.id, tube = %job.tube, "Payload: {}", job.payload_str());
        Box::pin(async { Ok(()) })
    }
}

/// Look up a handler that can be named in settings.
pub fn builtin_handler(name: &str) -> Option<Arc<dyn TubeHandler>> {
    match name {
        "log" => Some(Arc::new(LogHandler)),
        _ => None,
    }
}

/// Helper macro for creating tube handlers from async closures.
///
/// The closure receives an owned `Job`.
#[macro_export]
macro_rules! tube_handler {
    (|$job:ident| $body:expr) => {
        $crate::FnHandler::new(move |$job: &$crate::Job| {
            let $job = $job.clone();
            Box::pin(async move { $body })
        })
    };
}
