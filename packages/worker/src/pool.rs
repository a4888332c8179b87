//! Several workers, each on its own connection, hosted as actors.

use std::collections::BTreeSet;

use client::JobQueue;
use futures_util::future::join_all;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::messages::WorkerMessage;
use crate::worker::{RunLimits, RunReport, StopHandle, Worker, WorkerError};
use crate::worker_actor::WorkerActor;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),
    #[error("Worker unreachable: {0}")]
    Unreachable(String),
}

struct PoolMember {
    actor: ActorRef<WorkerMessage>,
    handle: JoinHandle<()>,
    stop: StopHandle,
}

/// A set of worker actors driven together.
pub struct WorkerPool {
    members: Vec<PoolMember>,
}

impl WorkerPool {
    /// Spawn one actor per worker.
    pub async fn spawn<Q: JobQueue + 'static>(workers: Vec<Worker<Q>>) -> Result<Self, PoolError> {
        let mut members = Vec::with_capacity(workers.len());
        for worker in workers {
            let stop = worker.stop_handle();
            let (actor, handle) = Actor::spawn(None, WorkerActor::<Q>::new(), worker)
                .await
                .map_err(|e| PoolError::Spawn(e.to_string()))?;
            members.push(PoolMember {
                actor,
                handle,
                stop,
            });
        }

        tracing::info!("Started worker pool with {} workers", members.len());
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Run every worker with the same limits and collect their outcomes.
    pub async fn run(&self, limits: RunLimits) -> Vec<Result<RunReport, WorkerError>> {
        let calls = self.members.iter().map(|member| async move {
            let result = ractor::rpc::call(
                &member.actor,
                |reply| WorkerMessage::Run { limits, reply },
                None,
            )
            .await;
            match result {
                Ok(CallResult::Success(outcome)) => outcome,
                Ok(_) => Err(WorkerError::Actor("worker stopped before replying".into())),
                Err(e) => Err(WorkerError::Actor(e.to_string())),
            }
        });
        join_all(calls).await
    }

    /// Tubes watched by each worker.
    pub async fn tubes(&self) -> Result<Vec<BTreeSet<String>>, PoolError> {
        let mut all = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let result = ractor::rpc::call(&member.actor, |reply| WorkerMessage::Tubes { reply }, None).await;
            match result {
                Ok(CallResult::Success(tubes)) => all.push(tubes),
                Ok(_) => return Err(PoolError::Unreachable("no reply".into())),
                Err(e) => return Err(PoolError::Unreachable(e.to_string())),
            }
        }
        Ok(all)
    }

    /// Ask every worker to stop after its current job.
    pub fn stop(&self) {
        for member in &self.members {
            member.stop.stop();
        }
    }

    /// Stop the actors and wait for them to exit.
    pub async fn shutdown(self) {
        self.stop();
        for member in &self.members {
            let _ = member.actor.send_message(WorkerMessage::Shutdown);
        }
        for member in self.members {
            let _ = member.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use client::MemoryServer;
    use ractor::ActorStatus;
    use std::sync::Arc;
    use std::time::Duration;
    use tube_core::PutOptions;

    #[tokio::test]
    async fn workers_share_the_tube() {
        let server = MemoryServer::new();
        let mut producer = server.connect();
        for i in 0..6 {
            producer
                .put("jobs", format!("{}", i).into(), PutOptions::default())
                .await
                .unwrap();
        }

        let mut registry = HandlerRegistry::new();
        registry.register("jobs", crate::tube_handler!(|_job| Ok(())));
        let registry = Arc::new(registry);

        let workers = (0..3)
            .map(|_| {
                let mut worker = Worker::new(server.connect(), Arc::clone(&registry));
                worker.add_tube("jobs").unwrap();
                worker
            })
            .collect();
        let pool = WorkerPool::spawn(workers).await.unwrap();
        assert_eq!(pool.len(), 3);

        let outcomes = pool.run(RunLimits::default().with_item_limit(10)).await;
        let processed: u64 = outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap().processed)
            .sum();
        assert_eq!(processed, 6);
        assert!(server.is_empty());

        let tubes = pool.tubes().await.unwrap();
        assert!(tubes.iter().all(|t| t.contains("jobs")));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_actor_is_reported_as_actor_error() {
        let server = MemoryServer::new();
        let mut worker = Worker::new(server.connect(), Arc::new(HandlerRegistry::new()));
        worker.add_tube("jobs").unwrap();
        let pool = WorkerPool::spawn(vec![worker]).await.unwrap();

        let actor = pool.members[0].actor.clone();
        actor.send_message(WorkerMessage::Shutdown).unwrap();
        while actor.get_status() != ActorStatus::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcomes = pool.run(RunLimits::default().with_item_limit(1)).await;
        assert!(matches!(outcomes[0], Err(WorkerError::Actor(_))));
        pool.shutdown().await;
    }
}
