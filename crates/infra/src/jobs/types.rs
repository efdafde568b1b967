//! Core job types and the job lifecycle state machine.
//!
//! A [`Job`] can only be obtained through validated construction: `Job::queued`,
//! a transition method, or `TryFrom<JobParts>` for rows and deserialized input.
//! Every path runs [`Job::validate`], so a `Job` value in hand always satisfies
//! the ledger invariants.

use core::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use openlabs_core::{DomainError, UserId, ensure_utc};

/// Internal numeric job identifier (assigned by the ledger).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External task-queue identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id for queue submissions that do not need deduplication.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet picked up by a worker
    Queued,
    /// A worker is executing the task body
    InProgress,
    /// Finished with a result payload
    Complete,
    /// Finished with an error message
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Status as reported to callers polling a job.
///
/// `NotFound` covers both "no such job" and "not yours" and is never stored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
    NotFound,
}

impl From<Option<&Job>> for ReportedStatus {
    fn from(job: Option<&Job>) -> Self {
        match job.map(Job::status) {
            Some(JobStatus::Queued) => ReportedStatus::Queued,
            Some(JobStatus::InProgress) => ReportedStatus::InProgress,
            Some(JobStatus::Complete) => ReportedStatus::Complete,
            Some(JobStatus::Failed) => ReportedStatus::Failed,
            None => ReportedStatus::NotFound,
        }
    }
}

/// How a caller refers to a job: internal numeric id or external task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLookup {
    Id(JobId),
    TaskId(TaskId),
}

impl FromStr for JobLookup {
    type Err = DomainError;

    /// All-digit input is a numeric id; anything else is a task id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::invalid_id("job identifier must not be empty"));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            let id = s
                .parse::<i64>()
                .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;
            Ok(JobLookup::Id(JobId(id)))
        } else {
            Ok(JobLookup::TaskId(TaskId::new(s)))
        }
    }
}

impl From<TaskId> for JobLookup {
    fn from(task_id: TaskId) -> Self {
        JobLookup::TaskId(task_id)
    }
}

/// Job construction/transition error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The resulting value would violate a job invariant.
    #[error(transparent)]
    Invalid(#[from] DomainError),

    /// The state machine does not allow this move (double delivery or a logic bug).
    #[error("illegal transition for job {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Unvalidated job fields, as read from storage or external input.
///
/// Timestamps keep their offset so a non-UTC value is rejected instead of
/// being silently converted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParts {
    pub id: JobId,
    pub task_id: TaskId,
    pub task_name: String,
    pub attempt: Option<u32>,
    pub enqueue_time: DateTime<FixedOffset>,
    pub start_time: Option<DateTime<FixedOffset>>,
    pub finish_time: Option<DateTime<FixedOffset>>,
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub owner: UserId,
}

/// A tracked background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobParts")]
pub struct Job {
    id: JobId,
    task_id: TaskId,
    task_name: String,
    attempt: Option<u32>,
    enqueue_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    status: JobStatus,
    result: Option<JsonValue>,
    error_message: Option<String>,
    owner: UserId,
}

impl Job {
    /// Create a freshly queued job.
    pub fn queued(
        id: JobId,
        task_id: TaskId,
        task_name: impl Into<String>,
        owner: UserId,
        enqueue_time: DateTime<Utc>,
    ) -> Result<Self, JobError> {
        let job = Self {
            id,
            task_id,
            task_name: task_name.into(),
            attempt: None,
            enqueue_time,
            start_time: None,
            finish_time: None,
            status: JobStatus::Queued,
            result: None,
            error_message: None,
            owner,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    pub fn enqueue_time(&self) -> DateTime<Utc> {
        self.enqueue_time
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.finish_time
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result(&self) -> Option<&JsonValue> {
        self.result.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    /// QUEUED -> IN_PROGRESS.
    pub fn start(&self, start_time: DateTime<Utc>, attempt: u32) -> Result<Job, JobError> {
        self.expect_status(JobStatus::Queued, JobStatus::InProgress)?;
        let next = Job {
            status: JobStatus::InProgress,
            start_time: Some(start_time),
            attempt: Some(attempt),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// IN_PROGRESS -> IN_PROGRESS for a queue redelivery.
    ///
    /// Records the newer attempt and keeps the original start time. The attempt
    /// must strictly increase; replaying the same delivery is not a transition.
    pub fn redeliver(&self, attempt: u32) -> Result<Job, JobError> {
        self.expect_status(JobStatus::InProgress, JobStatus::InProgress)?;
        if self.attempt.is_some_and(|current| attempt <= current) {
            return Err(DomainError::validation(format!(
                "redelivery attempt {attempt} does not exceed recorded attempt {}",
                self.attempt.unwrap_or_default()
            ))
            .into());
        }
        let next = Job {
            attempt: Some(attempt),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// IN_PROGRESS -> COMPLETE.
    pub fn complete(&self, finish_time: DateTime<Utc>, result: JsonValue) -> Result<Job, JobError> {
        self.expect_status(JobStatus::InProgress, JobStatus::Complete)?;
        let next = Job {
            status: JobStatus::Complete,
            finish_time: Some(finish_time),
            result: Some(result),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// IN_PROGRESS -> FAILED.
    pub fn fail(&self, finish_time: DateTime<Utc>, error: impl Into<String>) -> Result<Job, JobError> {
        self.expect_status(JobStatus::InProgress, JobStatus::Failed)?;
        let next = Job {
            status: JobStatus::Failed,
            finish_time: Some(finish_time),
            error_message: Some(error.into()),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    fn expect_status(&self, from: JobStatus, to: JobStatus) -> Result<(), JobError> {
        if self.status == from {
            Ok(())
        } else {
            Err(JobError::IllegalTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to,
            })
        }
    }

    /// Check every ledger invariant.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.task_id.as_str().trim().is_empty() {
            return Err(DomainError::validation("task_id must not be empty"));
        }
        if self.task_name.trim().is_empty() {
            return Err(DomainError::validation("task_name must not be empty"));
        }

        match self.attempt {
            Some(0) => return Err(DomainError::validation("attempt must be >= 1")),
            None if self.status != JobStatus::Queued => {
                return Err(DomainError::validation(format!(
                    "attempt is required once a job is {}",
                    self.status
                )));
            }
            _ => {}
        }

        let (needs_start, needs_finish) = match self.status {
            JobStatus::Queued => (false, false),
            JobStatus::InProgress => (true, false),
            JobStatus::Complete | JobStatus::Failed => (true, true),
        };
        if self.start_time.is_some() != needs_start {
            return Err(DomainError::validation(format!(
                "start_time must {}be set when status is {}",
                if needs_start { "" } else { "not " },
                self.status
            )));
        }
        if self.finish_time.is_some() != needs_finish {
            return Err(DomainError::validation(format!(
                "finish_time must {}be set when status is {}",
                if needs_finish { "" } else { "not " },
                self.status
            )));
        }

        let (needs_result, needs_error) = match self.status {
            JobStatus::Complete => (true, false),
            JobStatus::Failed => (false, true),
            JobStatus::Queued | JobStatus::InProgress => (false, false),
        };
        if self.result.is_some() != needs_result {
            return Err(DomainError::validation(format!(
                "result must {}be present when status is {}",
                if needs_result { "" } else { "not " },
                self.status
            )));
        }
        if self.error_message.is_some() != needs_error {
            return Err(DomainError::validation(format!(
                "error_message must {}be present when status is {}",
                if needs_error { "" } else { "not " },
                self.status
            )));
        }

        if let Some(start) = self.start_time {
            if start < self.enqueue_time {
                return Err(DomainError::validation("start_time precedes enqueue_time"));
            }
            if let Some(finish) = self.finish_time {
                if finish < start {
                    return Err(DomainError::validation("finish_time precedes start_time"));
                }
            }
        }

        Ok(())
    }
}

impl TryFrom<JobParts> for Job {
    type Error = JobError;

    fn try_from(parts: JobParts) -> Result<Self, Self::Error> {
        let job = Job {
            id: parts.id,
            task_id: parts.task_id,
            task_name: parts.task_name,
            attempt: parts.attempt,
            enqueue_time: ensure_utc("enqueue_time", parts.enqueue_time)?,
            start_time: parts
                .start_time
                .map(|ts| ensure_utc("start_time", ts))
                .transpose()?,
            finish_time: parts
                .finish_time
                .map(|ts| ensure_utc("finish_time", ts))
                .transpose()?,
            status: parts.status,
            result: parts.result,
            error_message: parts.error_message,
            owner: parts.owner,
        };
        job.validate()?;
        Ok(job)
    }
}

impl From<&Job> for JobParts {
    fn from(job: &Job) -> Self {
        JobParts {
            id: job.id,
            task_id: job.task_id.clone(),
            task_name: job.task_name.clone(),
            attempt: job.attempt,
            enqueue_time: job.enqueue_time.fixed_offset(),
            start_time: job.start_time.map(|ts| ts.fixed_offset()),
            finish_time: job.finish_time.map(|ts| ts.fixed_offset()),
            status: job.status,
            result: job.result.clone(),
            error_message: job.error_message.clone(),
            owner: job.owner,
        }
    }
}
