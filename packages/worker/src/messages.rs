//! Message types for actor communication.

use std::collections::BTreeSet;

use ractor::RpcReplyPort;

use crate::worker::{RunLimits, RunReport, WorkerError};

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run the worker loop and reply with its report.
    Run {
        limits: RunLimits,
        reply: RpcReplyPort<Result<RunReport, WorkerError>>,
    },

    /// Get the watched tubes.
    Tubes { reply: RpcReplyPort<BTreeSet<String>> },

    /// Shutdown the worker.
    Shutdown,
}
