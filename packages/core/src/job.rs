//! Job domain types for work items held by the queue engine.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Most urgent priority accepted by beanstalkd.
pub const URGENT_PRIORITY: u32 = 0;

/// Priority used when nothing else is configured.
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Default time-to-run, in seconds.
pub const DEFAULT_TTR: u32 = 60;

/// Default put/release delay, in seconds.
pub const DEFAULT_DELAY: u32 = 0;

/// Identifier assigned by the engine when a job is put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Parse a job ID from its decimal representation.
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self(s.trim().parse()?))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a job, as reported by the engine.
///
/// The worker never sets this directly: it only observes transitions caused
/// by its own reserve/release/bury/delete calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Delayed => "delayed",
            JobState::Reserved => "reserved",
            JobState::Buried => "buried",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States that can be inspected with a peek. Reserved jobs cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeekState {
    Ready,
    Delayed,
    Buried,
}

impl PeekState {
    /// Drain order: ready first, then delayed, then buried.
    pub const ALL: [PeekState; 3] = [PeekState::Ready, PeekState::Delayed, PeekState::Buried];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeekState::Ready => "ready",
            PeekState::Delayed => "delayed",
            PeekState::Buried => "buried",
        }
    }
}

impl std::fmt::Display for PeekState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeekState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(PeekState::Ready),
            "delayed" => Ok(PeekState::Delayed),
            "buried" => Ok(PeekState::Buried),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

impl From<PeekState> for JobState {
    fn from(state: PeekState) -> Self {
        match state {
            PeekState::Ready => JobState::Ready,
            PeekState::Delayed => JobState::Delayed,
            PeekState::Buried => JobState::Buried,
        }
    }
}

/// A job as handed out by the engine: id, tube and opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Engine-assigned identifier.
    pub id: JobId,
    /// The tube this job belongs to.
    pub tube: String,
    /// Opaque payload; its encoding is a matter between producer and handler.
    pub payload: Bytes,
}

impl Job {
    pub fn new(id: JobId, tube: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            tube: tube.into(),
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8 text, lossily converted.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Options for submitting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    /// Lower values are more urgent.
    pub priority: u32,
    /// Time spent in the delayed state before becoming ready.
    pub delay: Duration,
    /// Time a worker has to finish once it reserved the job.
    pub ttr: Duration,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: Duration::from_secs(DEFAULT_DELAY as u64),
            ttr: Duration::from_secs(DEFAULT_TTR as u64),
        }
    }
}

impl PutOptions {
    /// Set the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the time-to-run.
    pub fn with_ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr;
        self
    }
}
