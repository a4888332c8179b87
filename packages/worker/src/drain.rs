//! Removes every ready, delayed and buried job from a managed tube.
//!
//! Jobs reserved by a worker while the drain runs are not touched; they come
//! back when released, so a drain is complete only for a quiet tube.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use client::{JobQueue, QueueError};
use tokio::sync::broadcast;
use tube_core::{PeekState, WorkerEvent};

/// Drain tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    /// How long the tube stays paused while it is drained.
    pub grace: Duration,
    /// Passes over all states before giving up.
    pub max_passes: u32,
    /// Jobs handled per state and pass.
    pub max_jobs_per_pass: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            max_passes: 10,
            max_jobs_per_pass: 10_000,
        }
    }
}

/// Result of a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Passes that removed at least one job.
    pub passes: u32,
    pub deleted: u64,
    /// The tube is not managed here and was left alone.
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Empties managed tubes.
pub struct TubeDrainer<Q> {
    queue: Q,
    managed: BTreeSet<String>,
    config: DrainConfig,
    event_tx: Option<broadcast::Sender<WorkerEvent>>,
}

impl<Q: JobQueue> TubeDrainer<Q> {
    pub fn new<I, S>(queue: Q, managed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue,
            managed: managed.into_iter().map(Into::into).collect(),
            config: DrainConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: DrainConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<WorkerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn is_managed(&self, tube: &str) -> bool {
        self.managed.contains(tube)
    }

    pub fn into_inner(self) -> Q {
        self.queue
    }

    /// Delete every ready, delayed and buried job of `tube`.
    pub async fn drain(&mut self, tube: &str) -> Result<DrainReport, QueueError> {
        if !self.is_managed(tube) {
            tracing::info!(tube = %tube, "Not draining unmanaged tube");
            return Ok(DrainReport::skipped());
        }

        match self.queue.pause_tube(tube, self.config.grace).await {
            Ok(()) => {}
            // Nothing was ever put there, or it emptied itself already.
            Err(QueueError::TubeNotFound(_)) => return Ok(DrainReport::default()),
            Err(e) => return Err(e),
        }

        let drained = self.drain_passes(tube).await;
        let resumed = self.queue.resume_tube(tube).await;
        let report = drained?;
        match resumed {
            Ok(()) | Err(QueueError::TubeNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(
            tube = %tube,
            passes = report.passes,
            "Drained {} jobs",
            report.deleted
        );
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(WorkerEvent::TubeDrained {
                tube: tube.to_string(),
                passes: report.passes,
                deleted: report.deleted,
                timestamp: Utc::now(),
            });
        }
        Ok(report)
    }

    async fn drain_passes(&mut self, tube: &str) -> Result<DrainReport, QueueError> {
        let mut report = DrainReport::default();

        for pass in 1..=self.config.max_passes {
            let mut removed = 0;
            for state in PeekState::ALL {
                removed += match state {
                    PeekState::Delayed => {
                        self.kick_all(tube).await?;
                        self.delete_all(tube, PeekState::Ready).await?
                    }
                    state => self.delete_all(tube, state).await?,
                };
            }

            tracing::debug!(tube = %tube, pass, removed, "Drain pass done");
            if removed == 0 {
                break;
            }
            report.passes += 1;
            report.deleted += removed;
        }

        Ok(report)
    }

    /// Kick until nothing moves. Buried jobs are kicked before delayed ones,
    /// so one kick may not reach the delayed jobs.
    async fn kick_all(&mut self, tube: &str) -> Result<u64, QueueError> {
        let max = self.config.max_jobs_per_pass;
        let mut kicked = 0;
        while kicked < max {
            let moved = self.queue.kick(tube, max - kicked).await?;
            if moved == 0 {
                break;
            }
            kicked += moved;
        }
        Ok(kicked)
    }

    async fn delete_all(&mut self, tube: &str, state: PeekState) -> Result<u64, QueueError> {
        let mut deleted = 0;
        for _ in 0..self.config.max_jobs_per_pass {
            let Some(job) = self.queue.peek(tube, state).await? else {
                break;
            };
            match self.queue.delete(job.id).await {
                Ok(()) => deleted += 1,
                Err(QueueError::NotFound(id)) => {
                    tracing::debug!(job_id = %id, tube = %tube, "Job gone before delete");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::MemoryServer;
    use tube_core::PutOptions;

    #[tokio::test]
    async fn unmanaged_tubes_are_left_alone() {
        let server = MemoryServer::new();
        let mut conn = server.connect();
        conn.put("other", "x".into(), PutOptions::default()).await.unwrap();

        let mut drainer = TubeDrainer::new(server.connect(), ["mine"]);
        let report = drainer.drain("other").await.unwrap();
        assert!(report.skipped);
        assert_eq!(server.len(), 1);
    }

    #[tokio::test]
    async fn missing_tube_is_already_drained() {
        let server = MemoryServer::new();
        let mut drainer = TubeDrainer::new(server.connect(), ["ghost"]);

        let report = drainer.drain("ghost").await.unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn small_passes_still_empty_the_tube() {
        let server = MemoryServer::new();
        let mut conn = server.connect();
        for _ in 0..5 {
            conn.put("q", "x".into(), PutOptions::default()).await.unwrap();
        }

        let config = DrainConfig {
            max_jobs_per_pass: 2,
            ..Default::default()
        };
        let mut drainer = TubeDrainer::new(server.connect(), ["q"]).with_config(config);
        let report = drainer.drain("q").await.unwrap();

        assert_eq!(report.deleted, 5);
        assert_eq!(report.passes, 2);
        assert!(server.is_empty());
    }
}
