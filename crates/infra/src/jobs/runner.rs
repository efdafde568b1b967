//! Job runner: pulls deliveries off the task queue, runs the registered task
//! body under a timeout, and mirrors each execution into the job ledger.
//!
//! Ledger bookkeeping happens in two hooks around the task body:
//!
//! - [`JobRunner::on_job_start`] moves the row to IN_PROGRESS (or records a
//!   redelivery attempt)
//! - [`JobRunner::on_job_end`] reads the stored queue result and moves the row
//!   to COMPLETE or FAILED
//!
//! Hook failures are logged and never abort the task: the queue result is the
//! source of truth for the caller, the ledger is best-effort history.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use openlabs_core::UserId;

use crate::queue::{Delivery, TaskOutcome, TaskQueue, TaskResult};

use super::store::JobLedger;
use super::types::{JobLookup, JobStatus, TaskId};

/// Queue metadata handed to a task body.
///
/// Task bodies may run more than once for the same `task_id` (redelivery);
/// `attempt` tells them which delivery this is.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub attempt: u32,
    pub owner: UserId,
    pub enqueue_time: DateTime<Utc>,
}

/// Error returned by a task body. Stored stringified as the job's error message.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid task arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A named unit of background work.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut TaskContext, args: JsonValue) -> Result<JsonValue, TaskError>;
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrent jobs
    pub max_jobs: usize,
    /// Hard per-job timeout
    pub job_timeout: Duration,
    /// Deliveries beyond this attempt are failed without running
    pub max_tries: u32,
    /// How long one dequeue call waits for work
    pub poll_interval: Duration,
    /// How often abandoned deliveries are returned to the queue
    pub recovery_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "openlabs-worker".to_string(),
            max_jobs: 4,
            job_timeout: Duration::from_secs(20 * 60),
            max_tries: 3,
            poll_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_jobs(mut self, max: usize) -> Self {
        self.max_jobs = max.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries.max(1);
        self
    }
}

/// Runner statistics snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    running: AtomicUsize,
    started: Instant,
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }
}

impl StatsCounters {
    fn snapshot(&self) -> RunnerStats {
        RunnerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_timed_out: self.timed_out.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Handle to control a running runner.
#[derive(Debug)]
pub struct JobRunnerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<StatsCounters>,
}

impl JobRunnerHandle {
    /// Stop taking new work and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job runner task panicked");
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.snapshot()
    }
}

/// Background job runner.
pub struct JobRunner {
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<dyn JobLedger>,
    tasks: HashMap<&'static str, Arc<dyn Task>>,
    config: RunnerConfig,
    stats: Arc<StatsCounters>,
}

impl JobRunner {
    pub fn new(queue: Arc<dyn TaskQueue>, ledger: Arc<dyn JobLedger>, config: RunnerConfig) -> Self {
        Self {
            queue,
            ledger,
            tasks: HashMap::new(),
            config,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Register a task body under its name.
    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.name(), task);
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.snapshot()
    }

    /// Ledger hook run before the task body.
    pub async fn on_job_start(&self, task_id: &TaskId, attempt: u32) {
        let lookup = JobLookup::TaskId(task_id.clone());
        let job = match self.ledger.find(&lookup).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(task_id = %task_id, attempt, "no ledger row for task; running untracked");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, attempt, error = %e, "failed to load job at start");
                return;
            }
        };

        let written = match job.status() {
            JobStatus::Queued => {
                // Clamped so a worker clock behind the submitter cannot break ordering.
                let start_time = Utc::now().max(job.enqueue_time());
                self.ledger.mark_in_progress(&job, start_time, attempt).await
            }
            JobStatus::InProgress if job.attempt().is_none_or(|current| attempt > current) => {
                info!(
                    task_id = %task_id,
                    job_id = %job.id(),
                    previous_attempt = ?job.attempt(),
                    attempt,
                    "job redelivered"
                );
                self.ledger.mark_redelivered(&job, attempt).await
            }
            JobStatus::InProgress => {
                debug!(task_id = %task_id, attempt, "start replayed for current attempt; ignoring");
                return;
            }
            JobStatus::Complete | JobStatus::Failed => {
                warn!(
                    task_id = %task_id,
                    job_id = %job.id(),
                    status = %job.status(),
                    attempt,
                    "delivery for a finished job; ledger left untouched"
                );
                return;
            }
        };

        match written {
            Ok(job) => debug!(task_id = %task_id, job_id = %job.id(), attempt, "job in progress"),
            Err(e) => error!(task_id = %task_id, attempt, error = %e, "failed to mark job in progress"),
        }
    }

    /// Ledger hook run after the task result has been stored.
    pub async fn on_job_end(&self, task_id: &TaskId) {
        let result = match self.queue.get_result(task_id).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                error!(task_id = %task_id, "no stored result for finished task");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to read task result");
                return;
            }
        };

        let mut job = match self.ledger.find(&JobLookup::TaskId(task_id.clone())).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(task_id = %task_id, "no ledger row for finished task");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to load job at end");
                return;
            }
        };
        if job.status() == JobStatus::Queued {
            // The row was written after the start hook looked for it.
            let start_time = result.started_at.max(job.enqueue_time());
            job = match self.ledger.mark_in_progress(&job, start_time, result.attempt).await {
                Ok(job) => {
                    info!(task_id = %task_id, job_id = %job.id(), "late ledger row caught up at end");
                    job
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "failed to catch up queued job at end");
                    return;
                }
            };
        }
        if job.status() != JobStatus::InProgress {
            warn!(
                task_id = %task_id,
                job_id = %job.id(),
                status = %job.status(),
                "job not in progress at end; ledger left untouched"
            );
            return;
        }

        let finish_time = job
            .start_time()
            .map_or(result.finished_at, |start| result.finished_at.max(start));
        let written = match result.outcome {
            TaskOutcome::Success(payload) => self.ledger.mark_complete(&job, finish_time, payload).await,
            TaskOutcome::Failure(message) => self.ledger.mark_failed(&job, finish_time, message).await,
        };
        match written {
            Ok(job) => info!(task_id = %task_id, job_id = %job.id(), status = %job.status(), "job finished"),
            Err(e) => error!(task_id = %task_id, error = %e, "failed to record job outcome"),
        }
    }

    /// Handle one delivery end to end.
    pub async fn process(&self, delivery: Delivery) {
        let task_id = delivery.task_id.clone();
        let attempt = delivery.attempt;

        // A crash between storing the result and acking leaves a finished task
        // in flight; do not run its body again.
        match self.queue.get_result(&task_id).await {
            Ok(Some(_)) => {
                debug!(task_id = %task_id, attempt, "result already stored; acking redelivery");
                self.on_job_end(&task_id).await;
                self.ack(&task_id).await;
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "could not check for existing result"),
        }

        self.stats.running.fetch_add(1, Ordering::Relaxed);
        self.on_job_start(&task_id, attempt).await;

        let started_at = Utc::now();
        let outcome = if attempt > self.config.max_tries {
            warn!(task_id = %task_id, attempt, max_tries = self.config.max_tries, "max tries exceeded");
            TaskOutcome::Failure(format!("max {} tries exceeded", self.config.max_tries))
        } else {
            self.execute(delivery).await
        };

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        match &outcome {
            TaskOutcome::Success(_) => self.stats.succeeded.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Failure(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };

        let result = TaskResult {
            outcome,
            attempt,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.queue.store_result(&task_id, &result).await {
            error!(task_id = %task_id, error = %e, "failed to store task result");
        }
        self.on_job_end(&task_id).await;
        self.ack(&task_id).await;
        self.stats.running.fetch_sub(1, Ordering::Relaxed);
    }

    async fn execute(&self, delivery: Delivery) -> TaskOutcome {
        let Some(task) = self.tasks.get(delivery.task_name.as_str()).cloned() else {
            warn!(task_id = %delivery.task_id, task_name = %delivery.task_name, "no task registered");
            return TaskOutcome::Failure(format!("unknown task '{}'", delivery.task_name));
        };

        let mut ctx = TaskContext {
            task_id: delivery.task_id,
            task_name: delivery.task_name,
            attempt: delivery.attempt,
            owner: delivery.owner,
            enqueue_time: delivery.enqueue_time,
        };

        let timeout = self.config.job_timeout;
        match tokio::time::timeout(timeout, task.run(&mut ctx, delivery.args)).await {
            Ok(Ok(value)) => TaskOutcome::Success(value),
            Ok(Err(e)) => {
                warn!(task_id = %ctx.task_id, task_name = %ctx.task_name, error = %e, "task failed");
                TaskOutcome::Failure(e.to_string())
            }
            Err(_) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                error!(
                    task_id = %ctx.task_id,
                    task_name = %ctx.task_name,
                    timeout_secs = timeout.as_secs(),
                    "task timed out; infrastructure state unknown"
                );
                TaskOutcome::Failure(format!("task timed out after {}s", timeout.as_secs()))
            }
        }
    }

    async fn ack(&self, task_id: &TaskId) {
        if let Err(e) = self.queue.ack(task_id).await {
            error!(task_id = %task_id, error = %e, "failed to ack delivery");
        }
    }

    /// Spawn the runner loop on the current tokio runtime.
    pub fn spawn(self) -> JobRunnerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let runner = Arc::new(self);
        let join = tokio::spawn(run_loop(runner, shutdown_rx));
        JobRunnerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn run_loop(runner: Arc<JobRunner>, mut shutdown: watch::Receiver<bool>) {
    let name = runner.config.name.clone();
    let max_jobs = runner.config.max_jobs.max(1);
    let semaphore = Arc::new(Semaphore::new(max_jobs));
    let mut recovery = tokio::time::interval(runner.config.recovery_interval);
    info!(runner = %name, max_jobs, "job runner started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => permit,
            _ = shutdown.changed() => break,
        };
        let Ok(permit) = permit else { break };

        let delivery = tokio::select! {
            delivery = runner.queue.dequeue(runner.config.poll_interval) => delivery,
            _ = recovery.tick() => {
                match runner.queue.recover_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(runner = %name, recovered = n, "re-queued abandoned deliveries"),
                    Err(e) => error!(runner = %name, error = %e, "failed to recover deliveries"),
                }
                continue;
            }
            _ = shutdown.changed() => break,
        };

        match delivery {
            Ok(Some(delivery)) => {
                debug!(
                    runner = %name,
                    task_id = %delivery.task_id,
                    task_name = %delivery.task_name,
                    attempt = delivery.attempt,
                    "dequeued task"
                );
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner.process(delivery).await;
                    drop(permit);
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!(runner = %name, error = %e, "failed to dequeue");
                tokio::time::sleep(runner.config.poll_interval).await;
            }
        }
    }

    // Drain in-flight jobs before returning.
    let _ = semaphore.acquire_many(max_jobs as u32).await;
    info!(runner = %name, "job runner stopped");
}
