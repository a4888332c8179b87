//! Core domain types for tube workers.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobId and job states
//! - Stats as reported by the queue engine
//! - Settings for servers and tubes
//! - Events for observing workers

mod config;
mod events;
mod job;
mod stats;

pub use config::{
    ConfigError, DEFAULT_PORT, DEFAULT_SERVER_ALIAS, MAX_TUBE_NAME_LEN, ServerConfig, Settings,
    TubeOptions, TubeOverrides, validate_tube_name,
};
pub use events::{FailureAction, WorkerEvent, WorkerId};
pub use job::{
    DEFAULT_DELAY, DEFAULT_PRIORITY, DEFAULT_TTR, Job, JobId, JobState, PeekState, PutOptions,
    URGENT_PRIORITY,
};
pub use stats::{StatValue, Stats, StatsScope};
