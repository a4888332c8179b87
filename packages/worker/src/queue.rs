//! Item-style access to a single tube.

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use client::{JobQueue, QueueError, ReserveTimeout};
use tube_core::{JobId, StatsScope, TubeOptions};

use crate::drain::{DrainConfig, DrainReport, TubeDrainer};

/// A claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub item_id: JobId,
    pub data: Bytes,
    /// When the job was put, derived from its age.
    pub created: DateTime<Utc>,
}

/// A tube seen as a simple queue: create, claim, delete or release items.
///
/// The connection watches only this tube.
pub struct TubeQueue<Q> {
    queue: Q,
    tube: String,
    options: TubeOptions,
    drain: DrainConfig,
}

impl<Q: JobQueue> TubeQueue<Q> {
    /// Open the tube on a fresh connection.
    pub async fn open(queue: Q, tube: impl Into<String>, options: TubeOptions) -> Result<Self, QueueError> {
        let mut this = Self {
            queue,
            tube: tube.into(),
            options,
            drain: DrainConfig::default(),
        };
        this.create_queue().await?;
        Ok(this)
    }

    pub fn with_drain_config(mut self, config: DrainConfig) -> Self {
        self.drain = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.tube
    }

    /// Watch the tube, and nothing else.
    pub async fn create_queue(&mut self) -> Result<(), QueueError> {
        self.queue.watch(&self.tube).await?;
        if self.tube != "default" {
            self.queue.ignore("default").await?;
        }
        Ok(())
    }

    /// Delete every job of the tube.
    pub async fn delete_queue(&mut self) -> Result<DrainReport, QueueError> {
        let tube = self.tube.clone();
        TubeDrainer::new(&mut self.queue, [tube.as_str()])
            .with_config(self.drain)
            .drain(&tube)
            .await
    }

    pub async fn create_item(&mut self, data: impl Into<Bytes>) -> Result<JobId, QueueError> {
        self.queue
            .put(&self.tube, data.into(), self.options.put_options())
            .await
    }

    /// Reserve the next ready item, without waiting.
    pub async fn claim_item(&mut self) -> Result<Option<Item>, QueueError> {
        let Some(job) = self.queue.reserve(ReserveTimeout::Poll).await? else {
            return Ok(None);
        };

        let age = self
            .queue
            .stats(&StatsScope::Job(job.id))
            .await?
            .age()
            .unwrap_or_default();
        let created = i64::try_from(age)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Ok(Some(Item {
            item_id: job.id,
            data: job.payload,
            created,
        }))
    }

    pub async fn delete_item(&mut self, item: &Item) -> Result<(), QueueError> {
        self.queue.delete(item.item_id).await
    }

    /// Give a claimed item back with the tube's release priority and delay.
    pub async fn release_item(&mut self, item: &Item) -> Result<(), QueueError> {
        self.queue
            .release(
                item.item_id,
                self.options.release_priority,
                self.options.release_delay(),
            )
            .await
    }

    /// Ready items in the tube.
    pub async fn number_of_items(&mut self) -> Result<u64, QueueError> {
        match self.queue.stats(&StatsScope::Tube(self.tube.clone())).await {
            Ok(stats) => Ok(stats.ready_jobs().unwrap_or_default()),
            Err(QueueError::TubeNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::MemoryServer;

    #[tokio::test]
    async fn items_round_the_lifecycle() {
        let server = MemoryServer::new();
        let mut queue = TubeQueue::open(server.connect(), "mail", TubeOptions::default())
            .await
            .unwrap();
        assert_eq!(queue.number_of_items().await.unwrap(), 0);

        queue.create_item("one").await.unwrap();
        queue.create_item("two").await.unwrap();
        assert_eq!(queue.number_of_items().await.unwrap(), 2);

        let item = queue.claim_item().await.unwrap().unwrap();
        assert_eq!(item.data, Bytes::from("one"));
        assert!(item.created <= Utc::now());
        assert_eq!(queue.number_of_items().await.unwrap(), 1);

        queue.release_item(&item).await.unwrap();
        assert_eq!(queue.number_of_items().await.unwrap(), 2);

        let item = queue.claim_item().await.unwrap().unwrap();
        queue.delete_item(&item).await.unwrap();
        assert_eq!(queue.number_of_items().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn only_its_own_tube_is_claimed() {
        let server = MemoryServer::new();
        let mut other = server.connect();
        other.put("default", "elsewhere".into(), Default::default()).await.unwrap();

        let mut queue = TubeQueue::open(server.connect(), "mine", TubeOptions::default())
            .await
            .unwrap();
        assert!(queue.claim_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_queue_drains_the_tube() {
        let server = MemoryServer::new();
        let mut queue = TubeQueue::open(server.connect(), "bulk", TubeOptions::default())
            .await
            .unwrap();
        for i in 0..4 {
            queue.create_item(format!("item {}", i)).await.unwrap();
        }

        let report = queue.delete_queue().await.unwrap();
        assert_eq!(report.deleted, 4);
        assert_eq!(queue.number_of_items().await.unwrap(), 0);
        assert!(server.is_empty());
    }
}
