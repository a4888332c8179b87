//! The worker loop: reserve, dispatch to the tube's handler, then delete,
//! release or bury.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use client::{JobQueue, QueueError, ReserveTimeout};
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tube_core::{FailureAction, Job, StatsScope, TubeOptions, WorkerEvent, WorkerId};

use crate::handler::{HandlerError, HandlerRegistry, HandlerResult, TubeHandler};
use crate::policy::{FailureDecision, SuspendPolicy, decide};

const DEFAULT_TUBE: &str = "default";

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),
    /// The actor hosting the worker could not be reached or died.
    #[error("Worker actor error: {0}")]
    Actor(String),
}

/// Limits for one run. With neither set, the run never ends on its own.
///
/// The item limit counts handled jobs plus jobs discarded for lack of a
/// handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    pub time_limit: Option<Duration>,
    pub item_limit: Option<u64>,
}

impl RunLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_item_limit(mut self, limit: u64) -> Self {
        self.item_limit = Some(limit);
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.time_limit.is_some() || self.item_limit.is_some()
    }

    fn reached(&self, elapsed: Duration, processed: u64) -> bool {
        self.time_limit.is_some_and(|limit| elapsed >= limit)
            || self.item_limit.is_some_and(|limit| processed >= limit)
    }
}

/// What happened during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Handler invocations, whatever their outcome.
    pub processed: u64,
    pub succeeded: u64,
    pub released: u64,
    pub buried: u64,
    /// Jobs deleted because their tube had no handler.
    pub discarded: u64,
    /// Jobs that disappeared before they could be settled.
    pub vanished: u64,
    /// Tubes skipped after a handler asked to suspend them.
    pub suspended_tubes: BTreeSet<String>,
    /// The run ended through a `StopHandle`.
    pub stopped: bool,
}

impl RunReport {
    /// A run that skipped tubes did not do all the work it could.
    pub fn is_partial(&self) -> bool {
        !self.suspended_tubes.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: RunReport) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.released += other.released;
        self.buried += other.buried;
        self.discarded += other.discarded;
        self.vanished += other.vanished;
        self.suspended_tubes.extend(other.suspended_tubes);
        self.stopped |= other.stopped;
    }
}

/// Asks a running worker to stop between jobs.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Clear the flag so the worker can run again.
    pub fn reset(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
    }

    /// Resolves once a stop is requested.
    async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep, waking early if a stop is requested.
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.stopped() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// Tunables of the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Timeout of the blocking reserve used when no limit is set. `None`
    /// waits until a job arrives.
    pub block_timeout: Option<Duration>,
    /// Pause after a blocking reserve came back empty.
    pub idle_backoff: Duration,
    pub suspend_policy: SuspendPolicy,
    /// Options for tubes without their own.
    pub default_options: TubeOptions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            block_timeout: None,
            idle_backoff: Duration::from_secs(5),
            suspend_policy: SuspendPolicy::default(),
            default_options: TubeOptions::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_suspend_policy(mut self, policy: SuspendPolicy) -> Self {
        self.suspend_policy = policy;
        self
    }

    pub fn with_default_options(mut self, options: TubeOptions) -> Self {
        self.default_options = options;
        self
    }
}

/// Processes jobs from a set of watched tubes over one connection.
pub struct Worker<Q> {
    id: WorkerId,
    queue: Q,
    handlers: Arc<HandlerRegistry>,
    watched: BTreeSet<String>,
    /// Tubes the connection currently watches.
    connection_watch: BTreeSet<String>,
    options: HashMap<String, TubeOptions>,
    config: WorkerConfig,
    stop: StopHandle,
    event_tx: Option<broadcast::Sender<WorkerEvent>>,
}

impl<Q: JobQueue> Worker<Q> {
    /// Create a worker. `queue` must be a fresh connection, watching only
    /// the `default` tube.
    pub fn new(queue: Q, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            id: WorkerId::new(),
            queue,
            handlers,
            watched: BTreeSet::new(),
            connection_watch: BTreeSet::from([DEFAULT_TUBE.to_string()]),
            options: HashMap::new(),
            config: WorkerConfig::default(),
            stop: StopHandle::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<WorkerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Watch a tube with its own options.
    pub fn with_tube(mut self, tube: impl Into<String>, options: TubeOptions) -> Result<Self, WorkerError> {
        let tube = tube.into();
        self.add_tube(tube.clone())?;
        self.options.insert(tube, options);
        Ok(self)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Handle for stopping this worker from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The watched set.
    pub fn tubes(&self) -> &BTreeSet<String> {
        &self.watched
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    /// Add a tube to the watched set. Takes effect at the next run.
    pub fn add_tube(&mut self, tube: impl Into<String>) -> Result<(), WorkerError> {
        let tube = tube.into();
        tube_core::validate_tube_name(&tube).map_err(|e| WorkerError::Configuration(e.to_string()))?;
        self.watched.insert(tube);
        Ok(())
    }

    /// Remove a tube from the watched set. Returns whether it was watched.
    pub fn remove_tube(&mut self, tube: &str) -> bool {
        self.options.remove(tube);
        self.watched.remove(tube)
    }

    /// Options in force for a tube.
    pub fn tube_options(&self, tube: &str) -> &TubeOptions {
        self.options.get(tube).unwrap_or(&self.config.default_options)
    }

    /// Process jobs until a limit is reached, the worker is stopped, or no
    /// watched tube remains.
    pub async fn run(&mut self, limits: RunLimits) -> Result<RunReport, WorkerError> {
        if self.watched.is_empty() {
            return Err(WorkerError::Configuration("no tubes to watch".into()));
        }

        let watched = self.watched.clone();
        self.sync_watch_list(&watched).await?;

        tracing::info!(
            worker_id = %self.id,
            "Starting run on tubes: {}",
            watched.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        self.emit(WorkerEvent::RunStarted {
            worker_id: self.id,
            tubes: watched.iter().cloned().collect(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let mut report = RunReport::default();
        let mut active = watched.clone();
        self.run_loop(&limits, started, &mut active, &mut report).await?;

        // Suspended tubes are skipped for one run only.
        if !report.suspended_tubes.is_empty() {
            self.sync_watch_list(&watched).await?;
        }

        let elapsed = started.elapsed();
        if report.is_partial() {
            tracing::warn!(
                worker_id = %self.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Processed {} jobs, suspended tubes: {}",
                report.processed,
                report.suspended_tubes.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        } else {
            tracing::info!(
                worker_id = %self.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Processed {} jobs",
                report.processed
            );
        }
        self.emit(WorkerEvent::RunFinished {
            worker_id: self.id,
            processed: report.processed,
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    async fn run_loop(
        &mut self,
        limits: &RunLimits,
        started: Instant,
        active: &mut BTreeSet<String>,
        report: &mut RunReport,
    ) -> Result<(), WorkerError> {
        loop {
            if self.stop.is_stopped() {
                report.stopped = true;
                return Ok(());
            }
            if active.is_empty() {
                return Ok(());
            }

            let job = match self.queue.reserve(ReserveTimeout::Poll).await? {
                Some(job) => job,
                None if limits.is_bounded() => return Ok(()),
                None => {
                    let timeout = self
                        .config
                        .block_timeout
                        .map_or(ReserveTimeout::Block, ReserveTimeout::Wait);
                    // A stop abandons the wait; the engine hands a job that
                    // was reserved meanwhile back after its TTR.
                    let stop = self.stop.clone();
                    let reserved = tokio::select! {
                        reserved = self.queue.reserve(timeout) => Some(reserved),
                        _ = stop.stopped() => None,
                    };
                    match reserved {
                        Some(reserved) => match reserved? {
                            Some(job) => job,
                            None => {
                                self.stop.sleep(self.config.idle_backoff).await;
                                continue;
                            }
                        },
                        None => continue,
                    }
                }
            };

            self.process(job, active, report).await?;

            if limits.reached(started.elapsed(), report.processed + report.discarded) {
                return Ok(());
            }
        }
    }

    async fn process(
        &mut self,
        job: Job,
        active: &mut BTreeSet<String>,
        report: &mut RunReport,
    ) -> Result<(), WorkerError> {
        self.emit(WorkerEvent::JobReserved {
            worker_id: self.id,
            job_id: job.id,
            tube: job.tube.clone(),
            timestamp: Utc::now(),
        });

        let Some(handler) = self.handlers.get(&job.tube) else {
            tracing::error!(job_id = %job.id, tube = %job.tube, "No handler for tube, deleting job");
            if settle(self.queue.delete(job.id).await, report)? {
                report.discarded += 1;
                self.emit(WorkerEvent::JobDiscarded {
                    worker_id: self.id,
                    job_id: job.id,
                    tube: job.tube.clone(),
                    timestamp: Utc::now(),
                });
            }
            return Ok(());
        };

        let options = self.tube_options(&job.tube).clone();
        tracing::debug!(job_id = %job.id, tube = %job.tube, "Processing job");

        let started = Instant::now();
        let result = invoke(handler, &job, options.fork).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        report.processed += 1;

        match result {
            Ok(()) => {
                if settle(self.queue.delete(job.id).await, report)? {
                    report.succeeded += 1;
                    tracing::info!(job_id = %job.id, tube = %job.tube, elapsed_ms, "Job done");
                    self.emit(WorkerEvent::JobSucceeded {
                        worker_id: self.id,
                        job_id: job.id,
                        tube: job.tube.clone(),
                        elapsed_ms,
                        timestamp: Utc::now(),
                    });
                }
            }
            Err(HandlerError::Suspend(reason))
                if self.config.suspend_policy == SuspendPolicy::SkipTube =>
            {
                tracing::warn!(
                    job_id = %job.id,
                    tube = %job.tube,
                    elapsed_ms,
                    "Suspending tube for this run: {}",
                    reason
                );
                let released = self
                    .queue
                    .release(job.id, options.release_priority, options.release_delay())
                    .await;
                if settle(released, report)? {
                    report.released += 1;
                }
                self.suspend(&job.tube, active).await?;
                report.suspended_tubes.insert(job.tube.clone());
                self.emit(WorkerEvent::TubeSuspended {
                    worker_id: self.id,
                    job_id: job.id,
                    tube: job.tube.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
            }
            Err(error) => self.fail(&job, &options, error, elapsed_ms, report).await?,
        }

        Ok(())
    }

    async fn fail(
        &mut self,
        job: &Job,
        options: &TubeOptions,
        error: HandlerError,
        elapsed_ms: u64,
        report: &mut RunReport,
    ) -> Result<(), WorkerError> {
        let releases = match self.queue.stats(&StatsScope::Job(job.id)).await {
            Ok(stats) => stats.releases(),
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    tube = %job.tube,
                    elapsed_ms,
                    "Job failed, retry count unavailable: {}",
                    error
                );
                settle(Err(e), report)?;
                return Ok(());
            }
        };

        let (settled, action) = match decide(releases, options) {
            FailureDecision::Release { priority, delay } => {
                let settled = settle(self.queue.release(job.id, priority, delay).await, report)?;
                if settled {
                    report.released += 1;
                }
                (settled, FailureAction::Released)
            }
            FailureDecision::Bury { priority } => {
                let settled = settle(self.queue.bury(job.id, priority).await, report)?;
                if settled {
                    report.buried += 1;
                }
                (settled, FailureAction::Buried)
            }
        };

        tracing::error!(
            job_id = %job.id,
            tube = %job.tube,
            elapsed_ms,
            releases = releases.unwrap_or_default(),
            "Job failed ({:?}): {}",
            action,
            error
        );
        if settled {
            self.emit(WorkerEvent::JobFailed {
                worker_id: self.id,
                job_id: job.id,
                tube: job.tube.clone(),
                error: error.to_string(),
                releases,
                action,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Stop taking jobs from a tube until the end of the run.
    async fn suspend(&mut self, tube: &str, active: &mut BTreeSet<String>) -> Result<(), WorkerError> {
        active.remove(tube);
        // The last tube cannot be ignored; the loop ends instead.
        if !active.is_empty() && self.connection_watch.remove(tube) {
            self.queue.ignore(tube).await?;
        }
        Ok(())
    }

    /// Make the connection watch exactly `tubes`.
    async fn sync_watch_list(&mut self, tubes: &BTreeSet<String>) -> Result<(), WorkerError> {
        let missing: Vec<String> = tubes.difference(&self.connection_watch).cloned().collect();
        for tube in &missing {
            self.queue.watch(tube).await?;
        }
        let stale: Vec<String> = self.connection_watch.difference(tubes).cloned().collect();
        for tube in &stale {
            self.queue.ignore(tube).await?;
        }
        self.connection_watch = tubes.clone();
        Ok(())
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl<Q> std::fmt::Debug for Worker<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("watched", &self.watched)
            .field("config", &self.config)
            .finish()
    }
}

/// Turn a job operation's outcome into "settled or not". A job that
/// vanished (TTR expired and someone else took it, or it was deleted)
/// is logged and skipped; anything else ends the run.
fn settle(result: Result<(), QueueError>, report: &mut RunReport) -> Result<bool, WorkerError> {
    match result {
        Ok(()) => Ok(true),
        Err(QueueError::NotFound(id)) => {
            tracing::warn!(job_id = %id, "Job vanished before it could be settled");
            report.vanished += 1;
            Ok(false)
        }
        Err(e) => Err(WorkerError::QueueUnavailable(e)),
    }
}

/// Run a handler, on its own task when `fork` is set so that a panic
/// becomes a failure instead of taking the worker down.
async fn invoke(handler: Arc<dyn TubeHandler>, job: &Job, fork: bool) -> HandlerResult {
    let future = handler.handle(job);
    if !fork {
        return future.await;
    }

    match tokio::spawn(future).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Failed("handler panicked".into())),
        Err(e) => Err(HandlerError::failed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::MemoryServer;
    use tube_core::PutOptions;

    fn registry_with(tube: &str, fail: bool) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(
            tube,
            crate::FnHandler::new(move |_job: &Job| {
                Box::pin(async move {
                    if fail {
                        Err(HandlerError::failed("boom"))
                    } else {
                        Ok(())
                    }
                })
            }),
        );
        Arc::new(registry)
    }

    #[test]
    fn limits() {
        let none = RunLimits::unbounded();
        assert!(!none.is_bounded());
        assert!(!none.reached(Duration::from_secs(3600), 1_000_000));

        let items = RunLimits::default().with_item_limit(3);
        assert!(items.is_bounded());
        assert!(!items.reached(Duration::ZERO, 2));
        assert!(items.reached(Duration::ZERO, 3));

        let time = RunLimits::default().with_time_limit(Duration::from_secs(1));
        assert!(time.reached(Duration::from_secs(1), 0));
    }

    #[tokio::test]
    async fn empty_watch_set_is_a_configuration_error() {
        let server = MemoryServer::new();
        let mut worker = Worker::new(server.connect(), Arc::new(HandlerRegistry::new()));

        let err = worker.run(RunLimits::default().with_item_limit(1)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
        assert!(worker.add_tube("bad name").is_err());
    }

    #[tokio::test]
    async fn success_deletes_the_job() {
        let server = MemoryServer::new();
        let mut producer = server.connect();
        producer.put("mail", "x".into(), PutOptions::default()).await.unwrap();

        let mut worker = Worker::new(server.connect(), registry_with("mail", false));
        worker.add_tube("mail").unwrap();
        let report = worker.run(RunLimits::default().with_item_limit(10)).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn removed_tubes_are_ignored_next_run() {
        let server = MemoryServer::new();
        let mut producer = server.connect();
        producer.put("a", "x".into(), PutOptions::default()).await.unwrap();
        producer.put("b", "y".into(), PutOptions::default()).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register("a", crate::tube_handler!(|_job| Ok(())));
        registry.register("b", crate::tube_handler!(|_job| Ok(())));
        let mut worker = Worker::new(server.connect(), Arc::new(registry));
        worker.add_tube("a").unwrap();
        worker.add_tube("b").unwrap();
        assert!(worker.remove_tube("b"));
        assert!(!worker.remove_tube("b"));

        let report = worker.run(RunLimits::default().with_item_limit(10)).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(worker.queue_mut().watched().len(), 1);
        assert_eq!(server.len(), 1);
    }

    #[tokio::test]
    async fn forked_handler_panics_become_failures() {
        let server = MemoryServer::new();
        let mut producer = server.connect();
        let id = producer.put("t", "x".into(), PutOptions::default()).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register(
            "t",
            crate::FnHandler::new(|job: &Job| {
                let bug = job.payload_str() == "x";
                Box::pin(async move {
                    if bug {
                        panic!("handler bug");
                    }
                    Ok(())
                })
            }),
        );
        let mut worker = Worker::new(server.connect(), Arc::new(registry))
            .with_tube("t", TubeOptions::default().with_fork(true).with_max_retries(0))
            .unwrap();

        let report = worker.run(RunLimits::default().with_item_limit(1)).await.unwrap();
        assert_eq!(report.buried, 1);

        let stats = producer.stats(&StatsScope::Job(id)).await.unwrap();
        assert_eq!(stats.get_str("state"), Some("buried"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_handle_ends_a_run_waiting_with_a_timeout() {
        let server = MemoryServer::new();
        let mut worker = Worker::new(server.connect(), registry_with("t", false))
            .with_config(WorkerConfig::default().with_block_timeout(Duration::from_secs(1)));
        worker.add_tube("t").unwrap();
        let stop = worker.stop_handle();

        let run = tokio::spawn(async move { worker.run(RunLimits::unbounded()).await });
        tokio::time::sleep(Duration::from_secs(3)).await;
        stop.stop();

        let report = run.await.unwrap().unwrap();
        assert!(report.stopped);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_handle_interrupts_a_blocking_reserve() {
        let server = MemoryServer::new();
        let mut worker = Worker::new(server.connect(), registry_with("t", false));
        worker.add_tube("t").unwrap();
        let stop = worker.stop_handle();

        let run = tokio::spawn(async move { worker.run(RunLimits::unbounded()).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.stop();

        let report = tokio::time::timeout(Duration::from_secs(3600), run)
            .await
            .expect("run still blocked after stop")
            .unwrap()
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn discarded_jobs_count_toward_the_item_limit() {
        let server = MemoryServer::new();
        let mut producer = server.connect();
        for _ in 0..5 {
            producer.put("orphans", "x".into(), PutOptions::default()).await.unwrap();
        }

        let mut worker = Worker::new(server.connect(), Arc::new(HandlerRegistry::new()));
        worker.add_tube("orphans").unwrap();
        let report = worker.run(RunLimits::default().with_item_limit(2)).await.unwrap();

        assert_eq!(report.discarded, 2);
        assert_eq!(server.len(), 3);
    }
}
