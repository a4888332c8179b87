//! In-process queue engine.
//!
//! `MemoryServer` holds the jobs; each `MemoryQueue` is one connection to it
//! with its own watch list, like a beanstalkd client connection. Reserved
//! jobs return to the ready state when their TTR expires or their connection
//! is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tube_core::{
    DEFAULT_PRIORITY, Job, JobId, JobState, PeekState, PutOptions, StatValue, Stats, StatsScope,
};

use crate::{JobQueue, QueueError, ReserveTimeout, check_tube};

const DEFAULT_TUBE: &str = "default";

#[derive(Debug)]
struct Entry {
    id: JobId,
    tube: String,
    payload: Bytes,
    priority: u32,
    state: JobState,
    delay: Duration,
    ttr: Duration,
    created: Instant,
    /// When a delayed job becomes ready.
    ready_at: Option<Instant>,
    /// When a reserved job times out.
    deadline: Option<Instant>,
    reserved_by: Option<u64>,
    reserves: u64,
    timeouts: u64,
    releases: u64,
    buries: u64,
    kicks: u64,
}

impl Entry {
    fn job(&self) -> Job {
        Job::new(self.id, self.tube.clone(), self.payload.clone())
    }

    fn make_ready(&mut self) {
        self.state = JobState::Ready;
        self.ready_at = None;
        self.deadline = None;
        self.reserved_by = None;
    }

    fn reserved_by(&self, conn: u64) -> bool {
        self.state == JobState::Reserved && self.reserved_by == Some(conn)
    }

    fn stats(&self, now: Instant) -> Stats {
        let time_left = match self.state {
            JobState::Delayed => self.ready_at.map(|t| t.saturating_duration_since(now)),
            JobState::Reserved => self.deadline.map(|t| t.saturating_duration_since(now)),
            _ => None,
        }
        .unwrap_or_default();

        Stats::new()
            .with("id", self.id.0)
            .with("tube", self.tube.as_str())
            .with("state", self.state.as_str())
            .with("pri", u64::from(self.priority))
            .with("age", now.saturating_duration_since(self.created).as_secs())
            .with("delay", self.delay.as_secs())
            .with("ttr", self.ttr.as_secs())
            .with("time-left", time_left.as_secs())
            .with("reserves", self.reserves)
            .with("timeouts", self.timeouts)
            .with("releases", self.releases)
            .with("buries", self.buries)
            .with("kicks", self.kicks)
    }
}

#[derive(Debug, Default)]
struct State {
    next_job_id: u64,
    next_conn_id: u64,
    connections: u64,
    jobs: BTreeMap<JobId, Entry>,
    /// Pause length and end, by tube.
    paused: HashMap<String, (Duration, Instant)>,
    watchers: HashMap<String, u64>,
    total_jobs: HashMap<String, u64>,
}

impl State {
    /// Apply every transition that is due at `now`.
    fn tick(&mut self, now: Instant) {
        for entry in self.jobs.values_mut() {
            match entry.state {
                JobState::Delayed if entry.ready_at.is_some_and(|t| t <= now) => {
                    entry.make_ready();
                }
                JobState::Reserved if entry.deadline.is_some_and(|t| t <= now) => {
                    entry.timeouts += 1;
                    entry.make_ready();
                }
                _ => {}
            }
        }
        self.paused.retain(|_, (_, until)| *until > now);
    }

    /// Earliest time at which `tick` would change something.
    fn next_wakeup(&self) -> Option<Instant> {
        let jobs = self
            .jobs
            .values()
            .filter_map(|entry| entry.ready_at.or(entry.deadline));
        let pauses = self.paused.values().map(|(_, until)| *until);
        jobs.chain(pauses).min()
    }

    fn is_paused(&self, tube: &str) -> bool {
        self.paused.contains_key(tube)
    }

    fn tube_exists(&self, tube: &str) -> bool {
        tube == DEFAULT_TUBE
            || self.watchers.contains_key(tube)
            || self.jobs.values().any(|entry| entry.tube == tube)
    }

    fn count(&self, tube: Option<&str>, state: JobState) -> u64 {
        self.jobs
            .values()
            .filter(|entry| entry.state == state && tube.is_none_or(|t| entry.tube == t))
            .count() as u64
    }

    fn count_urgent(&self, tube: Option<&str>) -> u64 {
        self.jobs
            .values()
            .filter(|entry| {
                entry.state == JobState::Ready
                    && entry.priority < DEFAULT_PRIORITY
                    && tube.is_none_or(|t| entry.tube == t)
            })
            .count() as u64
    }

    fn tubes(&self) -> BTreeSet<String> {
        let mut tubes: BTreeSet<String> = self.jobs.values().map(|e| e.tube.clone()).collect();
        tubes.extend(self.watchers.keys().cloned());
        tubes.insert(DEFAULT_TUBE.to_string());
        tubes
    }

    fn reserve_ready(&mut self, conn: u64, watched: &BTreeSet<String>, now: Instant) -> Option<Job> {
        let id = self
            .jobs
            .values()
            .filter(|entry| {
                entry.state == JobState::Ready
                    && watched.contains(&entry.tube)
                    && !self.is_paused(&entry.tube)
            })
            .min_by_key(|entry| (entry.priority, entry.id))
            .map(|entry| entry.id)?;

        let entry = self.jobs.get_mut(&id)?;
        entry.state = JobState::Reserved;
        entry.reserved_by = Some(conn);
        entry.deadline = Some(now + entry.ttr);
        entry.reserves += 1;
        Some(entry.job())
    }

    fn add_watcher(&mut self, tube: &str) {
        *self.watchers.entry(tube.to_string()).or_default() += 1;
    }

    fn remove_watcher(&mut self, tube: &str) {
        if let Some(count) = self.watchers.get_mut(tube) {
            *count -= 1;
            if *count == 0 {
                self.watchers.remove(tube);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-process queue engine. Cloning shares the same jobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    shared: Arc<Shared>,
}

impl MemoryServer {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection, watching the `default` tube.
    pub fn connect(&self) -> MemoryQueue {
        let conn_id = {
            let mut state = self.shared.lock();
            state.next_conn_id += 1;
            state.connections += 1;
            state.add_watcher(DEFAULT_TUBE);
            state.next_conn_id
        };

        MemoryQueue {
            shared: Arc::clone(&self.shared),
            conn_id,
            watched: BTreeSet::from([DEFAULT_TUBE.to_string()]),
        }
    }

    /// Number of jobs held, in any state.
    pub fn len(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One connection to a `MemoryServer`.
#[derive(Debug)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
    conn_id: u64,
    watched: BTreeSet<String>,
}

impl MemoryQueue {
    /// Tubes this connection watches.
    pub fn watched(&self) -> &BTreeSet<String> {
        &self.watched
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.shared.lock();
        state.tick(Instant::now());
        state
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        for tube in &self.watched {
            state.remove_watcher(tube);
        }
        state.connections -= 1;

        let conn = self.conn_id;
        let mut released = false;
        for entry in state.jobs.values_mut().filter(|e| e.reserved_by(conn)) {
            entry.make_ready();
            released = true;
        }
        drop(state);

        if released {
            self.shared.changed.notify_waiters();
        }
    }
}

impl JobQueue for MemoryQueue {
    async fn put(&mut self, tube: &str, payload: Bytes, options: PutOptions) -> Result<JobId, QueueError> {
        check_tube(tube)?;
        let now = Instant::now();

        let id = {
            let mut state = self.lock();
            state.next_job_id += 1;
            let id = JobId(state.next_job_id);
            let delayed = !options.delay.is_zero();

            state.jobs.insert(
                id,
                Entry {
                    id,
                    tube: tube.to_string(),
                    payload,
                    priority: options.priority,
                    state: if delayed { JobState::Delayed } else { JobState::Ready },
                    delay: options.delay,
                    ttr: options.ttr.max(Duration::from_secs(1)),
                    created: now,
                    ready_at: delayed.then(|| now + options.delay),
                    deadline: None,
                    reserved_by: None,
                    reserves: 0,
                    timeouts: 0,
                    releases: 0,
                    buries: 0,
                    kicks: 0,
                },
            );
            *state.total_jobs.entry(tube.to_string()).or_default() += 1;
            id
        };

        self.shared.changed.notify_waiters();
        Ok(id)
    }

    async fn reserve(&mut self, timeout: ReserveTimeout) -> Result<Option<Job>, QueueError> {
        let give_up = match timeout {
            ReserveTimeout::Block => None,
            ReserveTimeout::Poll => Some(Instant::now()),
            ReserveTimeout::Wait(wait) => Some(Instant::now() + wait),
        };

        loop {
            // Registered before looking, so a put between the check and the
            // wait is not missed.
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = Instant::now();
            let wakeup = {
                let mut state = self.lock();
                if let Some(job) = state.reserve_ready(self.conn_id, &self.watched, now) {
                    return Ok(Some(job));
                }
                state.next_wakeup()
            };

            if give_up.is_some_and(|t| t <= now) {
                return Ok(None);
            }

            let until = match (wakeup, give_up) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match until {
                Some(until) => {
                    tokio::select! {
                        _ = &mut changed => {}
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let deletable = state
            .jobs
            .get(&id)
            .is_some_and(|entry| entry.state != JobState::Reserved || entry.reserved_by(self.conn_id));
        if !deletable {
            return Err(QueueError::NotFound(id));
        }

        state.jobs.remove(&id);
        Ok(())
    }

    async fn release(&mut self, id: JobId, priority: u32, delay: Duration) -> Result<(), QueueError> {
        let now = Instant::now();
        {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(&id)
                .filter(|entry| entry.reserved_by(self.conn_id))
                .ok_or(QueueError::NotFound(id))?;

            entry.make_ready();
            entry.priority = priority;
            entry.releases += 1;
            if !delay.is_zero() {
                entry.state = JobState::Delayed;
                entry.delay = delay;
                entry.ready_at = Some(now + delay);
            }
        }

        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn bury(&mut self, id: JobId, priority: u32) -> Result<(), QueueError> {
        let mut state = self.lock();
        let entry = state
            .jobs
            .get_mut(&id)
            .filter(|entry| entry.reserved_by(self.conn_id))
            .ok_or(QueueError::NotFound(id))?;

        entry.make_ready();
        entry.state = JobState::Buried;
        entry.priority = priority;
        entry.buries += 1;
        Ok(())
    }

    async fn peek(&mut self, tube: &str, state: PeekState) -> Result<Option<Job>, QueueError> {
        check_tube(tube)?;
        let guard = self.lock();
        let mut candidates = guard
            .jobs
            .values()
            .filter(|entry| entry.tube == tube && entry.state == JobState::from(state));

        let found = match state {
            PeekState::Ready => candidates.min_by_key(|e| (e.priority, e.id)),
            PeekState::Delayed => candidates.min_by_key(|e| (e.ready_at, e.id)),
            PeekState::Buried => candidates.next(),
        };
        Ok(found.map(Entry::job))
    }

    async fn kick(&mut self, tube: &str, max: u64) -> Result<u64, QueueError> {
        check_tube(tube)?;
        let kicked = {
            let mut state = self.lock();
            let in_tube = |state: &State, wanted: JobState| -> Vec<JobId> {
                let mut ids: Vec<(Option<Instant>, JobId)> = state
                    .jobs
                    .values()
                    .filter(|e| e.tube == tube && e.state == wanted)
                    .map(|e| (e.ready_at, e.id))
                    .collect();
                ids.sort();
                ids.into_iter().map(|(_, id)| id).collect()
            };

            let mut ids = in_tube(&*state, JobState::Buried);
            if ids.is_empty() {
                ids = in_tube(&*state, JobState::Delayed);
            }
            ids.truncate(usize::try_from(max).unwrap_or(usize::MAX));

            for id in &ids {
                if let Some(entry) = state.jobs.get_mut(id) {
                    entry.make_ready();
                    entry.kicks += 1;
                }
            }
            ids.len() as u64
        };

        if kicked > 0 {
            self.shared.changed.notify_waiters();
        }
        Ok(kicked)
    }

    async fn stats(&mut self, scope: &StatsScope) -> Result<Stats, QueueError> {
        let now = Instant::now();
        let state = self.lock();

        match scope {
            StatsScope::Job(id) => state
                .jobs
                .get(id)
                .map(|entry| entry.stats(now))
                .ok_or(QueueError::NotFound(*id)),
            StatsScope::Tube(tube) => {
                if !state.tube_exists(tube) {
                    return Err(QueueError::TubeNotFound(tube.clone()));
                }
                let (pause, left) = state
                    .paused
                    .get(tube.as_str())
                    .map(|(pause, until)| (pause.as_secs(), until.saturating_duration_since(now).as_secs()))
                    .unwrap_or_default();
                let t = Some(tube.as_str());

                Ok(Stats::new()
                    .with("name", tube.as_str())
                    .with("current-jobs-urgent", state.count_urgent(t))
                    .with("current-jobs-ready", state.count(t, JobState::Ready))
                    .with("current-jobs-reserved", state.count(t, JobState::Reserved))
                    .with("current-jobs-delayed", state.count(t, JobState::Delayed))
                    .with("current-jobs-buried", state.count(t, JobState::Buried))
                    .with("total-jobs", state.total_jobs.get(tube).copied().unwrap_or(0))
                    .with("current-watching", state.watchers.get(tube).copied().unwrap_or(0))
                    .with("pause", pause)
                    .with("pause-time-left", left))
            }
            StatsScope::Global => Ok(Stats::new()
                .with("current-jobs-urgent", state.count_urgent(None))
                .with("current-jobs-ready", state.count(None, JobState::Ready))
                .with("current-jobs-reserved", state.count(None, JobState::Reserved))
                .with("current-jobs-delayed", state.count(None, JobState::Delayed))
                .with("current-jobs-buried", state.count(None, JobState::Buried))
                .with("total-jobs", state.total_jobs.values().sum::<u64>())
                .with("current-tubes", state.tubes().len() as u64)
                .with("current-connections", state.connections)
                .with("pid", u64::from(std::process::id()))
                .with("version", StatValue::from(concat!("memory-", env!("CARGO_PKG_VERSION"))))),
        }
    }

    async fn pause_tube(&mut self, tube: &str, delay: Duration) -> Result<(), QueueError> {
        check_tube(tube)?;
        {
            let mut state = self.lock();
            if !state.tube_exists(tube) {
                return Err(QueueError::TubeNotFound(tube.to_string()));
            }
            if delay.is_zero() {
                state.paused.remove(tube);
            } else {
                state
                    .paused
                    .insert(tube.to_string(), (delay, Instant::now() + delay));
            }
        }

        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn list_tubes(&mut self) -> Result<BTreeSet<String>, QueueError> {
        Ok(self.lock().tubes())
    }

    async fn watch(&mut self, tube: &str) -> Result<usize, QueueError> {
        check_tube(tube)?;
        if self.watched.insert(tube.to_string()) {
            self.lock().add_watcher(tube);
        }
        Ok(self.watched.len())
    }

    async fn ignore(&mut self, tube: &str) -> Result<usize, QueueError> {
        if !self.watched.contains(tube) {
            return Ok(self.watched.len());
        }
        if self.watched.len() == 1 {
            return Err(QueueError::NotIgnored(tube.to_string()));
        }

        self.watched.remove(tube);
        self.lock().remove_watcher(tube);
        Ok(self.watched.len())
    }
}
