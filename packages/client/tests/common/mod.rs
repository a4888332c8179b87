#![allow(dead_code)]

use client::{JobQueue, MemoryQueue, MemoryServer, QueueError};
use tube_core::{JobId, PutOptions};

/// A server holding `count` ready jobs in `tube`, and the connection that put them.
pub async fn server_with_jobs(tube: &str, count: usize) -> Result<(MemoryServer, MemoryQueue, Vec<JobId>), QueueError> {
    let server = MemoryServer::new();
    let mut producer = server.connect();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(producer.put(tube, format!("job {}", i).into(), PutOptions::default()).await?);
    }
    Ok((server, producer, ids))
}
