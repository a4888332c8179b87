//! Event types for observing workers and drainers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::JobId;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Ulid);

impl WorkerId {
    /// Create a new unique worker ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a worker ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Released,
    Buried,
}

/// Events emitted by workers and drainers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A run started.
    RunStarted {
        worker_id: WorkerId,
        tubes: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A job was reserved and handed to its handler.
    JobReserved {
        worker_id: WorkerId,
        job_id: JobId,
        tube: String,
        timestamp: DateTime<Utc>,
    },
    /// A handler succeeded and the job was deleted.
    JobSucceeded {
        worker_id: WorkerId,
        job_id: JobId,
        tube: String,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A handler failed.
    JobFailed {
        worker_id: WorkerId,
        job_id: JobId,
        tube: String,
        error: String,
        releases: Option<u64>,
        action: FailureAction,
        timestamp: DateTime<Utc>,
    },
    /// No handler was registered for the tube; the job was deleted.
    JobDiscarded {
        worker_id: WorkerId,
        job_id: JobId,
        tube: String,
        timestamp: DateTime<Utc>,
    },
    /// A handler asked to stop processing its tube for this run.
    TubeSuspended {
        worker_id: WorkerId,
        job_id: JobId,
        tube: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A run ended.
    RunFinished {
        worker_id: WorkerId,
        processed: u64,
        timestamp: DateTime<Utc>,
    },
    /// A tube was drained.
    TubeDrained {
        tube: String,
        passes: u32,
        deleted: u64,
        timestamp: DateTime<Utc>,
    },
}

impl WorkerEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkerEvent::RunStarted { timestamp, .. } => *timestamp,
            WorkerEvent::JobReserved { timestamp, .. } => *timestamp,
            WorkerEvent::JobSucceeded { timestamp, .. } => *timestamp,
            WorkerEvent::JobFailed { timestamp, .. } => *timestamp,
            WorkerEvent::JobDiscarded { timestamp, .. } => *timestamp,
            WorkerEvent::TubeSuspended { timestamp, .. } => *timestamp,
            WorkerEvent::RunFinished { timestamp, .. } => *timestamp,
            WorkerEvent::TubeDrained { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerEvent::JobReserved { job_id, .. } => Some(*job_id),
            WorkerEvent::JobSucceeded { job_id, .. } => Some(*job_id),
            WorkerEvent::JobFailed { job_id, .. } => Some(*job_id),
            WorkerEvent::JobDiscarded { job_id, .. } => Some(*job_id),
            WorkerEvent::TubeSuspended { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get the tube associated with this event, if any.
    pub fn tube(&self) -> Option<&str> {
        match self {
            WorkerEvent::JobReserved { tube, .. } => Some(tube),
            WorkerEvent::JobSucceeded { tube, .. } => Some(tube),
            WorkerEvent::JobFailed { tube, .. } => Some(tube),
            WorkerEvent::JobDiscarded { tube, .. } => Some(tube),
            WorkerEvent::TubeSuspended { tube, .. } => Some(tube),
            WorkerEvent::TubeDrained { tube, .. } => Some(tube),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            WorkerEvent::RunStarted {
                worker_id, tubes, ..
            } => format!("Worker {} watching {}", worker_id, tubes.join(", ")),
            WorkerEvent::JobReserved { job_id, tube, .. } => {
                format!("Job {} reserved from {}", job_id, tube)
            }
            WorkerEvent::JobSucceeded {
                job_id, elapsed_ms, ..
            } => format!("Job {} succeeded in {}ms", job_id, elapsed_ms),
            WorkerEvent::JobFailed {
                job_id,
                error,
                action,
                ..
            } => match action {
                FailureAction::Released => format!("Job {} failed: {} (released)", job_id, error),
                FailureAction::Buried => format!("Job {} failed: {} (buried)", job_id, error),
            },
            WorkerEvent::JobDiscarded { job_id, tube, .. } => {
                format!("Job {} discarded, no handler for {}", job_id, tube)
            }
            WorkerEvent::TubeSuspended { tube, reason, .. } => {
                format!("Tube {} suspended: {}", tube, reason)
            }
            WorkerEvent::RunFinished {
                worker_id,
                processed,
                ..
            } => format!("Worker {} finished after {} jobs", worker_id, processed),
            WorkerEvent::TubeDrained {
                tube,
                passes,
                deleted,
                ..
            } => format!("Tube {} drained: {} jobs in {} passes", tube, deleted, passes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_round_trips_through_display() {
        let id = WorkerId::new();
        assert_eq!(WorkerId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn events_carry_job_and_tube() {
        let event = WorkerEvent::JobFailed {
            worker_id: WorkerId::new(),
            job_id: JobId(9),
            tube: "mail".into(),
            error: "smtp down".into(),
            releases: Some(1),
            action: FailureAction::Buried,
            timestamp: Utc::now(),
        };

        assert_eq!(event.job_id(), Some(JobId(9)));
        assert_eq!(event.tube(), Some("mail"));
        assert_eq!(event.description(), "Job 9 failed: smtp down (buried)");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "job_failed");
        assert_eq!(json["action"], "buried");
    }
}
