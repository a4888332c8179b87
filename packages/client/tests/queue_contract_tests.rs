#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use client::{JobQueue, QueueError, ReserveTimeout};
use tube_core::{PeekState, StatsScope};

/// Reserve, fail once, then finish a job through any engine.
async fn reserve_release_delete<Q: JobQueue>(mut queue: Q, tube: &str) -> Result<(), QueueError> {
    queue.watch(tube).await?;
    queue.ignore("default").await?;

    let job = queue.reserve(ReserveTimeout::Poll).await?.ok_or(QueueError::Closed)?;
    assert_eq!(job.tube, tube);
    queue.release(job.id, 10, Duration::ZERO).await?;

    let again = queue.reserve(ReserveTimeout::Poll).await?.ok_or(QueueError::Closed)?;
    assert_eq!(again.id, job.id);
    let stats = queue.stats(&StatsScope::Job(job.id)).await?;
    assert_eq!(stats.releases(), Some(1));
    assert_eq!(stats.tube(), Some(tube));

    queue.delete(job.id).await?;
    assert!(matches!(queue.delete(job.id).await, Err(QueueError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn contract_holds_for_owned_and_borrowed_connections() -> Result<(), Box<dyn Error>> {
    let (server, _producer, _) = common::server_with_jobs("contract", 2).await?;

    reserve_release_delete(server.connect(), "contract").await?;

    let mut conn = server.connect();
    reserve_release_delete(&mut conn, "contract").await?;
    assert!(server.is_empty());
    Ok(())
}

#[tokio::test]
async fn dropped_connection_gives_its_jobs_back() -> Result<(), Box<dyn Error>> {
    let (server, mut producer, ids) = common::server_with_jobs("work", 1).await?;

    {
        let mut consumer = server.connect();
        consumer.watch("work").await?;
        let job = consumer.reserve(ReserveTimeout::Poll).await?.ok_or("nothing reserved")?;
        assert_eq!(job.id, ids[0]);
        assert!(producer.peek("work", PeekState::Ready).await?.is_none());
    }

    let job = producer.peek("work", PeekState::Ready).await?.ok_or("job not released")?;
    assert_eq!(job.id, ids[0]);
    Ok(())
}

#[tokio::test]
async fn peeks_on_an_empty_tube_are_none() -> Result<(), Box<dyn Error>> {
    let (_server, mut producer, _) = common::server_with_jobs("quiet", 0).await?;
    producer.watch("quiet").await?;

    for state in PeekState::ALL {
        assert!(producer.peek("quiet", state).await?.is_none());
    }
    assert_eq!(producer.kick("quiet", 10).await?, 0);
    assert!(producer.list_tubes().await?.contains("quiet"));
    Ok(())
}

#[tokio::test]
async fn invalid_tube_names_are_rejected() -> Result<(), Box<dyn Error>> {
    let (server, _producer, _) = common::server_with_jobs("valid", 0).await?;
    let mut conn = server.connect();

    assert!(matches!(conn.watch("-leading-dash").await, Err(QueueError::InvalidTube(_))));
    assert!(matches!(conn.ignore("default").await, Err(QueueError::NotIgnored(_))));
    Ok(())
}
