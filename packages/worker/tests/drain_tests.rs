#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use client::{JobQueue, ReserveTimeout};
use tokio::sync::broadcast;
use tube_core::{PeekState, PutOptions, WorkerEvent};
use worker::{TubeDrainer, TubeQueue};

#[tokio::test]
async fn drain_removes_ready_delayed_and_buried_jobs() -> Result<(), Box<dyn Error>> {
    let (server, mut producer) = common::setup();
    common::put_many(&mut producer, "reports", 3).await?;
    for _ in 0..2 {
        producer
            .put(
                "reports",
                "later".into(),
                PutOptions::default().with_delay(Duration::from_secs(600)),
            )
            .await?;
    }
    let buried = producer.put("reports", "broken".into(), PutOptions::default().with_priority(0)).await?;
    producer.watch("reports").await?;
    let job = producer.reserve(ReserveTimeout::Poll).await?.ok_or("nothing reserved")?;
    assert_eq!(job.id, buried);
    producer.bury(job.id, 0).await?;

    let (tx, mut rx) = broadcast::channel(4);
    let mut drainer = TubeDrainer::new(server.connect(), ["reports"]).with_event_tx(tx);
    let report = drainer.drain("reports").await?;

    assert_eq!(report.deleted, 6);
    assert_eq!(report.passes, 1);
    assert!(!report.skipped);
    assert_eq!(common::ready_count(&mut producer, "reports").await?, 0);
    for state in PeekState::ALL {
        assert!(producer.peek("reports", state).await?.is_none());
    }
    assert!(matches!(
        rx.try_recv()?,
        WorkerEvent::TubeDrained { deleted: 6, passes: 1, .. }
    ));

    // Draining an empty tube changes nothing.
    let again = drainer.drain("reports").await?;
    assert_eq!(again.deleted, 0);
    assert_eq!(again.passes, 0);
    Ok(())
}

#[tokio::test]
async fn drain_leaves_unmanaged_tubes_alone() -> Result<(), Box<dyn Error>> {
    let (server, mut producer) = common::setup();
    common::put_many(&mut producer, "theirs", 4).await?;

    let mut drainer = TubeDrainer::new(server.connect(), ["ours"]);
    assert!(!drainer.is_managed("theirs"));
    let report = drainer.drain("theirs").await?;

    assert!(report.skipped);
    assert_eq!(report.deleted, 0);
    assert_eq!(common::ready_count(&mut producer, "theirs").await?, 4);
    Ok(())
}

#[tokio::test]
async fn drain_resumes_the_tube() -> Result<(), Box<dyn Error>> {
    let (server, mut producer) = common::setup();
    common::put_many(&mut producer, "jobs", 2).await?;

    let mut drainer = TubeDrainer::new(server.connect(), ["jobs"]);
    drainer.drain("jobs").await?;

    // A job put after the drain is handed out right away.
    let id = producer.put("jobs", "fresh".into(), PutOptions::default()).await?;
    let mut consumer = server.connect();
    consumer.watch("jobs").await?;
    let job = consumer.reserve(ReserveTimeout::Poll).await?.ok_or("tube still paused")?;
    assert_eq!(job.id, id);
    Ok(())
}

#[tokio::test]
async fn tube_queue_counts_and_drains_its_items() -> Result<(), Box<dyn Error>> {
    let (server, _producer) = common::setup();
    let mut queue = TubeQueue::open(server.connect(), "items", Default::default()).await?;
    assert_eq!(queue.name(), "items");

    for i in 0..3 {
        queue.create_item(format!("item {}", i)).await?;
    }
    assert_eq!(queue.number_of_items().await?, 3);

    let item = queue.claim_item().await?.ok_or("no item")?;
    assert_eq!(&item.data[..], b"item 0");
    queue.release_item(&item).await?;

    let report = queue.delete_queue().await?;
    assert_eq!(report.deleted, 3);
    assert_eq!(queue.number_of_items().await?, 0);
    Ok(())
}
