//! Actor hosting one worker and its connection.

use std::marker::PhantomData;

use client::JobQueue;
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::WorkerMessage;
use crate::worker::Worker;

/// Worker actor. Runs are handled one at a time, in message order.
pub struct WorkerActor<Q> {
    _queue: PhantomData<fn() -> Q>,
}

impl<Q> WorkerActor<Q> {
    pub fn new() -> Self {
        Self {
            _queue: PhantomData,
        }
    }
}

impl<Q> Default for WorkerActor<Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: JobQueue + 'static> Actor for WorkerActor<Q> {
    type Msg = WorkerMessage;
    type State = Worker<Q>;
    type Arguments = Worker<Q>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        worker: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", worker.id());
        Ok(worker)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        worker: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Run { limits, reply } => {
                let result = worker.run(limits).await;
                if let Err(e) = &result {
                    tracing::error!("Worker {} run failed: {}", worker.id(), e);
                }
                let _ = reply.send(result);
            }

            WorkerMessage::Tubes { reply } => {
                let _ = reply.send(worker.tubes().clone());
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", worker.id());
                myself.stop(None);
            }
        }

        Ok(())
    }
}
