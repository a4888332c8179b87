//! Job queue engine interface and its implementations.
//!
//! - `JobQueue` - typed operations a worker or drainer needs from an engine
//! - `Beanstalkd` - a connection to a beanstalkd server
//! - `MemoryServer` / `MemoryQueue` - an in-process engine with the same semantics
//! - `ServerFactory` - connections by server alias, built from `Settings`

mod beanstalkd;
mod factory;
mod memory;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tube_core::{Job, JobId, PeekState, PutOptions, Stats, StatsScope};

pub use beanstalkd::Beanstalkd;
pub use factory::{ServerFactory, ServerStatus};
pub use memory::{MemoryQueue, MemoryServer};

/// Errors reported by a queue engine.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Tube {0} not found")]
    TubeNotFound(String),
    #[error("Cannot ignore {0}, it is the only watched tube")]
    NotIgnored(String),
    #[error("Invalid tube name: {0:?}")]
    InvalidTube(String),
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("Connection closed by server")]
    Closed,
    #[error("Unexpected response: {0}")]
    Protocol(String),
    #[error("Server error: {0}")]
    Server(String),
}

impl QueueError {
    /// True when the connection itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            QueueError::Connection(_)
                | QueueError::ConnectTimeout(_)
                | QueueError::Closed
                | QueueError::Protocol(_)
        )
    }
}

/// How long a reserve may wait for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveTimeout {
    /// Wait until a job is available.
    Block,
    /// Return immediately.
    Poll,
    /// Wait at most this long.
    Wait(Duration),
}

/// Operations on a job queue engine, over one exclusively owned connection.
///
/// The connection keeps its own watch list, consulted by `reserve`. Empty
/// results are `None`, never errors.
pub trait JobQueue: Send + Sync {
    /// Put a job into a tube.
    fn put(
        &mut self,
        tube: &str,
        payload: Bytes,
        options: PutOptions,
    ) -> impl Future<Output = Result<JobId, QueueError>> + Send;

    /// Reserve the next ready job from the watched tubes.
    fn reserve(
        &mut self,
        timeout: ReserveTimeout,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;

    /// Delete a job.
    fn delete(&mut self, id: JobId) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Put a reserved job back, optionally delayed.
    fn release(
        &mut self,
        id: JobId,
        priority: u32,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Bury a reserved job.
    fn bury(&mut self, id: JobId, priority: u32)
    -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Look at the next job of a tube in the given state without reserving it.
    fn peek(
        &mut self,
        tube: &str,
        state: PeekState,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;

    /// Move up to `max` buried jobs (or, when none are buried, delayed jobs)
    /// of a tube to the ready state. Returns how many moved.
    fn kick(&mut self, tube: &str, max: u64)
    -> impl Future<Output = Result<u64, QueueError>> + Send;

    /// Statistics for the server, a tube or a job.
    fn stats(
        &mut self,
        scope: &StatsScope,
    ) -> impl Future<Output = Result<Stats, QueueError>> + Send;

    /// Stop handing out jobs from a tube for a while.
    fn pause_tube(
        &mut self,
        tube: &str,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Lift a pause early.
    fn resume_tube(&mut self, tube: &str) -> impl Future<Output = Result<(), QueueError>> + Send {
        self.pause_tube(tube, Duration::ZERO)
    }

    /// Tubes known to the server.
    fn list_tubes(&mut self) -> impl Future<Output = Result<BTreeSet<String>, QueueError>> + Send;

    /// Add a tube to this connection's watch list. Returns the watch count.
    fn watch(&mut self, tube: &str) -> impl Future<Output = Result<usize, QueueError>> + Send;

    /// Remove a tube from this connection's watch list. Returns the watch count.
    fn ignore(&mut self, tube: &str) -> impl Future<Output = Result<usize, QueueError>> + Send;
}

impl<T: JobQueue> JobQueue for &mut T {
    fn put(
        &mut self,
        tube: &str,
        payload: Bytes,
        options: PutOptions,
    ) -> impl Future<Output = Result<JobId, QueueError>> + Send {
        (**self).put(tube, payload, options)
    }

    fn reserve(
        &mut self,
        timeout: ReserveTimeout,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send {
        (**self).reserve(timeout)
    }

    fn delete(&mut self, id: JobId) -> impl Future<Output = Result<(), QueueError>> + Send {
        (**self).delete(id)
    }

    fn release(
        &mut self,
        id: JobId,
        priority: u32,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        (**self).release(id, priority, delay)
    }

    fn bury(&mut self, id: JobId, priority: u32)
    -> impl Future<Output = Result<(), QueueError>> + Send {
        (**self).bury(id, priority)
    }

    fn peek(
        &mut self,
        tube: &str,
        state: PeekState,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send {
        (**self).peek(tube, state)
    }

    fn kick(&mut self, tube: &str, max: u64)
    -> impl Future<Output = Result<u64, QueueError>> + Send {
        (**self).kick(tube, max)
    }

    fn stats(
        &mut self,
        scope: &StatsScope,
    ) -> impl Future<Output = Result<Stats, QueueError>> + Send {
        (**self).stats(scope)
    }

    fn pause_tube(
        &mut self,
        tube: &str,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        (**self).pause_tube(tube, delay)
    }

    fn resume_tube(&mut self, tube: &str) -> impl Future<Output = Result<(), QueueError>> + Send {
        (**self).resume_tube(tube)
    }

    fn list_tubes(&mut self) -> impl Future<Output = Result<BTreeSet<String>, QueueError>> + Send {
        (**self).list_tubes()
    }

    fn watch(&mut self, tube: &str) -> impl Future<Output = Result<usize, QueueError>> + Send {
        (**self).watch(tube)
    }

    fn ignore(&mut self, tube: &str) -> impl Future<Output = Result<usize, QueueError>> + Send {
        (**self).ignore(tube)
    }
}

fn check_tube(tube: &str) -> Result<(), QueueError> {
    tube_core::validate_tube_name(tube).map_err(|_| QueueError::InvalidTube(tube.to_string()))
}
