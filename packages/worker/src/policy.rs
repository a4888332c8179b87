//! What to do with a job whose handler failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tube_core::TubeOptions;

/// How a worker reacts to `HandlerError::Suspend`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendPolicy {
    /// Release the job and stop taking jobs from its tube until the run ends.
    #[default]
    SkipTube,
    /// Handle it like any other failure.
    Retry,
}

/// Outcome for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Release { priority: u32, delay: Duration },
    Bury { priority: u32 },
}

/// Release while the job has been released fewer than `max_retries` times,
/// bury afterwards. An unknown release count counts as exhausted.
pub fn decide(releases: Option<u64>, options: &TubeOptions) -> FailureDecision {
    match releases {
        Some(releases) if releases < u64::from(options.max_retries) => FailureDecision::Release {
            priority: options.release_priority,
            delay: options.release_delay(),
        },
        _ => FailureDecision::Bury {
            priority: options.priority,
        },
    }
}
