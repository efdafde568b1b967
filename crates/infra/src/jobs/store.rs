//! Job ledger abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use openlabs_auth::Requester;
use openlabs_core::UserId;

use super::types::{Job, JobError, JobId, JobLookup, JobStatus, TaskId};

/// Fields supplied when a job is first recorded.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub task_id: TaskId,
    pub task_name: String,
    pub owner: UserId,
    pub enqueue_time: DateTime<Utc>,
}

/// Job ledger error.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Job(#[from] JobError),
    /// The stored row no longer matches the value the transition was computed from.
    #[error("job {0} was modified concurrently")]
    Conflict(TaskId),
    #[error("job not found: {0}")]
    NotFound(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable record of every background task.
///
/// Implementations provide the storage primitives. Transitions are computed on
/// [`Job`] values and written with [`JobLedger::write_transition`], which must
/// only succeed if the stored row still equals `previous` (compare-and-set).
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Record a QUEUED job. Idempotent on `task_id`: an existing job is returned unchanged.
    async fn enqueue(&self, job: NewJob) -> Result<Job, LedgerError>;

    /// Fetch a job without any ownership check.
    async fn find(&self, lookup: &JobLookup) -> Result<Option<Job>, LedgerError>;

    /// List jobs ordered by id, optionally restricted to one owner and/or status.
    async fn query(
        &self,
        owner: Option<UserId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, LedgerError>;

    /// Replace `previous` with `next` if the stored row is still `previous`.
    async fn write_transition(&self, previous: &Job, next: &Job) -> Result<(), LedgerError>;

    /// Delete COMPLETE/FAILED jobs that finished strictly before `cutoff`.
    ///
    /// The cutoff is typed as UTC; raw input goes through `openlabs_core::parse_utc` first.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;

    /// IN_PROGRESS jobs whose start time is strictly before `started_before`.
    async fn in_progress_started_before(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError>;

    async fn mark_in_progress(
        &self,
        job: &Job,
        start_time: DateTime<Utc>,
        attempt: u32,
    ) -> Result<Job, LedgerError> {
        let next = job.start(start_time, attempt)?;
        self.write_transition(job, &next).await?;
        Ok(next)
    }

    async fn mark_redelivered(&self, job: &Job, attempt: u32) -> Result<Job, LedgerError> {
        let next = job.redeliver(attempt)?;
        self.write_transition(job, &next).await?;
        Ok(next)
    }

    async fn mark_complete(
        &self,
        job: &Job,
        finish_time: DateTime<Utc>,
        result: JsonValue,
    ) -> Result<Job, LedgerError> {
        let next = job.complete(finish_time, result)?;
        self.write_transition(job, &next).await?;
        Ok(next)
    }

    async fn mark_failed(
        &self,
        job: &Job,
        finish_time: DateTime<Utc>,
        error: String,
    ) -> Result<Job, LedgerError> {
        let next = job.fail(finish_time, error)?;
        self.write_transition(job, &next).await?;
        Ok(next)
    }

    /// Fetch a job on behalf of `requester`; other users' jobs read as absent.
    async fn get(
        &self,
        lookup: &JobLookup,
        requester: &Requester,
    ) -> Result<Option<Job>, LedgerError> {
        let job = self.find(lookup).await?;
        Ok(job.filter(|job| openlabs_auth::can_access(requester, job.owner())))
    }

    /// Jobs visible to `requester`; admins see every owner's jobs.
    async fn list(
        &self,
        requester: &Requester,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, LedgerError> {
        let owner = (!requester.privileged).then_some(requester.user_id);
        self.query(owner, status).await
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    jobs: BTreeMap<JobId, Job>,
    by_task: HashMap<TaskId, JobId>,
    next_id: i64,
}

/// In-memory job ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLedger for InMemoryJobLedger {
    async fn enqueue(&self, job: NewJob) -> Result<Job, LedgerError> {
        let mut state = self.state.write().await;
        if let Some(id) = state.by_task.get(&job.task_id) {
            if let Some(existing) = state.jobs.get(id) {
                return Ok(existing.clone());
            }
        }

        state.next_id += 1;
        let id = JobId(state.next_id);
        let queued = Job::queued(id, job.task_id, job.task_name, job.owner, job.enqueue_time)?;
        state.by_task.insert(queued.task_id().clone(), id);
        state.jobs.insert(id, queued.clone());
        Ok(queued)
    }

    async fn find(&self, lookup: &JobLookup) -> Result<Option<Job>, LedgerError> {
        let state = self.state.read().await;
        let id = match lookup {
            JobLookup::Id(id) => Some(*id),
            JobLookup::TaskId(task_id) => state.by_task.get(task_id).copied(),
        };
        Ok(id.and_then(|id| state.jobs.get(&id)).cloned())
    }

    async fn query(
        &self,
        owner: Option<UserId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, LedgerError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| owner.is_none_or(|owner| job.owner() == owner))
            .filter(|job| status.is_none_or(|status| job.status() == status))
            .cloned()
            .collect())
    }

    async fn write_transition(&self, previous: &Job, next: &Job) -> Result<(), LedgerError> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get_mut(&previous.id())
            .ok_or_else(|| LedgerError::NotFound(previous.task_id().clone()))?;
        if stored != previous {
            return Err(LedgerError::Conflict(previous.task_id().clone()));
        }
        *stored = next.clone();
        Ok(())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut state = self.state.write().await;
        let doomed: Vec<(JobId, TaskId)> = state
            .jobs
            .values()
            .filter(|job| job.status().is_terminal())
            .filter(|job| job.finish_time().is_some_and(|finish| finish < cutoff))
            .map(|job| (job.id(), job.task_id().clone()))
            .collect();

        for (id, task_id) in &doomed {
            state.jobs.remove(id);
            state.by_task.remove(task_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn in_progress_started_before(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status() == JobStatus::InProgress)
            .filter(|job| job.start_time().is_some_and(|start| start < started_before))
            .cloned()
            .collect())
    }
}
