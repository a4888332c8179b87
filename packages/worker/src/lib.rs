//! Job processing on top of a beanstalkd-style queue.
//!
//! This crate provides the worker loop that reserves jobs and dispatches
//! them to per-tube handlers, the drainer that empties managed tubes, and
//! the Ractor actors that host several workers at once.
//!
//! # Architecture
//!
//! - `Worker` - Reserves jobs from its watched tubes and settles them
//! - `TubeDrainer` - Deletes every job of a managed tube
//! - `TubeQueue` - One tube seen as a plain item queue
//! - `WorkerActor` / `WorkerPool` - Workers hosted as actors
//!
//! # Usage
//!
//! ```ignore
//! use worker::{HandlerRegistry, RunLimits, Worker, tube_handler};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("emails", tube_handler!(|job| send(job).await));
//!
//! let mut worker = Worker::new(server.connect(), Arc::new(registry));
//! worker.add_tube("emails")?;
//! let report = worker.run(RunLimits::default().with_item_limit(100)).await?;
//! ```

mod drain;
mod handler;
mod messages;
mod policy;
mod pool;
mod queue;
mod worker;
mod worker_actor;

pub use drain::{DrainConfig, DrainReport, TubeDrainer};
pub use handler::{
    FnHandler, HandlerError, HandlerFuture, HandlerRegistry, HandlerResult, LogHandler,
    TubeHandler, builtin_handler,
};
pub use messages::WorkerMessage;
pub use policy::{FailureDecision, SuspendPolicy, decide};
pub use pool::{PoolError, WorkerPool};
pub use queue::{Item, TubeQueue};
pub use worker::{RunLimits, RunReport, StopHandle, Worker, WorkerConfig, WorkerError};
pub use worker_actor::WorkerActor;

/// Re-exported for handlers and the `tube_handler!` macro.
pub use tube_core::Job;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
