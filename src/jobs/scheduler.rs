//! Recurring job scheduler.
//!
//! Each tick of a job goes through
//! `Scheduled → LockAcquired → Running → Completed | Failed → Scheduled`, or
//! `Scheduled → Skipped → Scheduled` when the distributed lock is not obtained
//! within `lock_timeout`. Failures never unregister a job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::lock::{JobLock, PgAdvisoryLock};
use super::schedule::CronSchedule;
use super::store::{JobStorage, PgJobStorage};
use super::types::{JobState, JobStatus, StorageOptions, TickOutcome};
use super::worker::{RecurringJobSpec, RecurringWorker};
use crate::db::{ConnectionFactory, PgConnector};
use crate::error::BrokerError;

/// Upper bound on how long the dispatcher sleeps with nothing due.
const IDLE_WAIT: Duration = Duration::from_secs(60);

struct JobEntry {
    schedule: CronSchedule,
    worker: Arc<dyn RecurringWorker>,
    state: JobState,
    next_due: Option<DateTime<Utc>>,
    last_outcome: Option<TickOutcome>,
    runs: u64,
    /// Ticks of this id currently holding the lock in this process.
    holding: usize,
}

struct SchedulerInner {
    options: StorageOptions,
    storage: Arc<dyn JobStorage>,
    lock: Arc<dyn JobLock>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    wake: Notify,
}

#[derive(Clone)]
pub struct RecurringJobScheduler {
    inner: Arc<SchedulerInner>,
}

impl RecurringJobScheduler {
    /// Back storage and locking with PostgreSQL, opening every connection
    /// through `factory`.
    pub fn configure(options: StorageOptions, factory: Arc<ConnectionFactory<PgConnector>>) -> Self {
        let storage = Arc::new(PgJobStorage::new(factory.clone()));
        let lock = Arc::new(PgAdvisoryLock::new(factory));
        Self::with_backend(options, storage, lock)
    }

    pub fn with_backend(
        options: StorageOptions,
        storage: Arc<dyn JobStorage>,
        lock: Arc<dyn JobLock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                options,
                storage,
                lock,
                jobs: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn options(&self) -> StorageOptions {
        self.inner.options
    }

    /// Register a job, or replace the schedule and worker of an existing id.
    ///
    /// The in-process registration always takes effect. A storage failure is
    /// logged and does not stop the job from running.
    pub async fn register(&self, spec: RecurringJobSpec) {
        let RecurringJobSpec { id, schedule, worker } = spec;
        let expression = schedule.expression().to_string();

        {
            let mut jobs = self.inner.lock_jobs();
            match jobs.get_mut(&id) {
                Some(entry) => {
                    info!(job_id = %id, schedule = %expression, "Recurring job schedule updated");
                    entry.schedule = schedule;
                    entry.worker = worker;
                    entry.next_due = None;
                }
                None => {
                    info!(job_id = %id, schedule = %expression, "Recurring job registered");
                    jobs.insert(
                        id.clone(),
                        JobEntry {
                            schedule,
                            worker,
                            state: JobState::Registered,
                            next_due: None,
                            last_outcome: None,
                            runs: 0,
                            holding: 0,
                        },
                    );
                }
            }
        }
        self.inner.wake.notify_one();

        if let Err(e) = self.inner.storage.upsert_recurring(&id, &expression).await {
            warn!(job_id = %id, "Failed to persist recurring job: {e}");
        }
    }

    /// Registered job ids, sorted.
    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn state(&self, id: &str) -> Option<JobState> {
        self.inner.lock_jobs().get(id).map(|entry| entry.state)
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.inner.lock_jobs().get(id).map(|entry| JobStatus {
            id: id.to_string(),
            schedule: entry.schedule.expression().to_string(),
            state: entry.state,
            next_due: entry.next_due,
            last_outcome: entry.last_outcome.clone(),
            runs: entry.runs,
        })
    }

    /// Run one full tick of `id` right now, outside its schedule.
    pub async fn run_once(&self, id: &str) -> Result<TickOutcome, BrokerError> {
        if !self.inner.lock_jobs().contains_key(id) {
            return Err(BrokerError::JobNotFound(id.to_string()));
        }
        Ok(self.inner.run_tick(id).await)
    }

    /// Migrate storage if configured, then start dispatching due jobs.
    pub async fn start(&self) -> Result<SchedulerHandle, BrokerError> {
        if self.inner.options.auto_migrate_schema {
            self.inner.storage.migrate().await?;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch(self.inner.clone(), shutdown_rx));
        info!(
            jobs = self.inner.lock_jobs().len(),
            lock_timeout = ?self.inner.options.lock_timeout,
            "Recurring job scheduler started"
        );
        Ok(SchedulerHandle { shutdown, task })
    }
}

impl SchedulerInner {
    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set `state` unless another tick of `id` still holds the lock.
    fn settle(&self, id: &str, state: JobState) {
        if let Some(entry) = self.lock_jobs().get_mut(id) {
            entry.state = if entry.holding > 0 { JobState::Running } else { state };
        }
    }

    /// Ids due at `now`, plus the earliest upcoming fire time.
    fn collect_due(&self, now: DateTime<Utc>) -> (Vec<String>, Option<DateTime<Utc>>) {
        let mut due = Vec::new();
        let mut earliest: Option<DateTime<Utc>> = None;

        for (id, entry) in self.lock_jobs().iter_mut() {
            match entry.next_due {
                Some(at) if at <= now => {
                    due.push(id.clone());
                    entry.next_due = entry.schedule.next_after(now);
                }
                Some(_) => {}
                None => {
                    entry.next_due = entry.schedule.next_after(now);
                    if entry.state == JobState::Registered {
                        entry.state = JobState::Scheduled;
                    }
                }
            }
            if let Some(next) = entry.next_due {
                earliest = Some(earliest.map_or(next, |e| e.min(next)));
            }
        }

        (due, earliest)
    }

    async fn run_tick(&self, id: &str) -> TickOutcome {
        let worker = match self.lock_jobs().get(id) {
            Some(entry) => entry.worker.clone(),
            None => return TickOutcome::Skipped,
        };

        let outcome = match self.lock.acquire(id, self.options.lock_timeout).await {
            Err(e) => {
                match &e {
                    BrokerError::LockAcquisitionTimeout { .. } => {
                        info!(job_id = id, "Job lock busy, skipping this tick")
                    }
                    _ => warn!(job_id = id, "Job lock unavailable, skipping this tick: {e}"),
                }
                TickOutcome::Skipped
            }
            Ok(guard) => {
                if let Some(entry) = self.lock_jobs().get_mut(id) {
                    entry.holding += 1;
                    entry.state = JobState::LockAcquired;
                }
                self.settle(id, JobState::Running);

                // A panicking worker surfaces as a JoinError instead of unwinding the tick.
                let result = match tokio::spawn(async move { worker.do_work().await }).await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("worker {e}")),
                };

                if let Some(entry) = self.lock_jobs().get_mut(id) {
                    entry.holding = entry.holding.saturating_sub(1);
                }

                if let Err(e) = guard.release().await {
                    warn!(job_id = id, "Failed to release job lock: {e}");
                }

                match result {
                    Ok(()) => {
                        info!(job_id = id, "Job completed");
                        TickOutcome::Completed
                    }
                    Err(e) => {
                        let err = BrokerError::JobExecution {
                            job_id: id.to_string(),
                            reason: format!("{e:#}"),
                        };
                        error!("{err}");
                        TickOutcome::Failed(format!("{e:#}"))
                    }
                }
            }
        };

        if let Some(entry) = self.lock_jobs().get_mut(id) {
            entry.last_outcome = Some(outcome.clone());
            if outcome != TickOutcome::Skipped {
                entry.runs += 1;
            }
        }
        self.settle(id, outcome.state());

        if outcome != TickOutcome::Skipped {
            if let Err(e) = self.storage.record_run(id, &outcome).await {
                warn!(job_id = id, "Failed to record job run: {e}");
            }
        }

        self.settle(id, JobState::Scheduled);
        outcome
    }
}

async fn dispatch(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = JoinSet::new();

    loop {
        while let Some(joined) = ticks.try_join_next() {
            log_tick_exit(joined);
        }

        let now = Utc::now();
        let (due, earliest) = inner.collect_due(now);
        for id in due {
            let inner = inner.clone();
            ticks.spawn(async move {
                inner.run_tick(&id).await;
            });
        }

        let wait = earliest
            .and_then(|next| (next - now).to_std().ok())
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = inner.wake.notified() => {}
            _ = shutdown.changed() => break,
        }
    }

    info!(in_flight = ticks.len(), "Recurring job scheduler stopping");
    while let Some(joined) = ticks.join_next().await {
        log_tick_exit(joined);
    }
    info!("Recurring job scheduler stopped");
}

fn log_tick_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Job tick task ended abnormally: {e}");
    }
}

/// Handle to the running dispatcher.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop dispatching and wait for in-flight ticks to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Scheduler task ended abnormally: {e}");
        }
    }

    /// Wait for the dispatcher to exit on its own, without signalling shutdown.
    pub async fn join(self) {
        let SchedulerHandle { shutdown, task } = self;
        if let Err(e) = task.await {
            error!("Scheduler task ended abnormally: {e}");
        }
        drop(shutdown);
    }
}
