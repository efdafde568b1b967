//! Ledger housekeeping tasks, enqueued periodically by the worker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};
use uuid::Uuid;

use openlabs_core::{UserId, parse_utc};

use crate::jobs::{JobLedger, Task, TaskContext, TaskError, TaskId};

use super::{PURGE_JOBS, REPORT_STALE_JOBS, parse_args};

/// Owner recorded on jobs the worker schedules for itself.
pub fn system_owner() -> UserId {
    UserId::from_uuid(Uuid::nil())
}

/// Task id shared by every worker for the same interval slot, so the queue
/// keeps only one copy of each scheduled run.
pub fn scheduled_task_id(task_name: &str, now: DateTime<Utc>, interval: Duration) -> TaskId {
    let secs = interval.num_seconds().max(1);
    TaskId::new(format!("{task_name}:{}", now.timestamp().div_euclid(secs)))
}

#[derive(Debug, Default, Deserialize)]
struct PurgeArgs {
    /// RFC 3339 UTC cutoff; defaults to now minus the retention window.
    cutoff: Option<String>,
}

/// Delete finished jobs older than the retention window.
pub struct PurgeJobsTask {
    ledger: Arc<dyn JobLedger>,
    retention: Duration,
}

impl PurgeJobsTask {
    pub fn new(ledger: Arc<dyn JobLedger>, retention: Duration) -> Self {
        Self { ledger, retention }
    }
}

#[async_trait]
impl Task for PurgeJobsTask {
    fn name(&self) -> &'static str {
        PURGE_JOBS
    }

    async fn run(&self, ctx: &mut TaskContext, args: JsonValue) -> Result<JsonValue, TaskError> {
        let args: PurgeArgs = if args.is_null() { PurgeArgs::default() } else { parse_args(args)? };
        let cutoff = match args.cutoff {
            Some(raw) => parse_utc("cutoff", &raw).map_err(|e| TaskError::InvalidArgs(e.to_string()))?,
            None => Utc::now() - self.retention,
        };

        let purged = self
            .ledger
            .purge_terminal_before(cutoff)
            .await
            .map_err(anyhow::Error::from)?;
        info!(task_id = %ctx.task_id, %cutoff, purged, "purged finished jobs");
        Ok(json!({ "purged": purged, "cutoff": cutoff }))
    }
}

/// Log jobs that have been IN_PROGRESS for longer than any job should run.
pub struct ReportStaleJobsTask {
    ledger: Arc<dyn JobLedger>,
    stale_after: Duration,
}

impl ReportStaleJobsTask {
    pub fn new(ledger: Arc<dyn JobLedger>, stale_after: Duration) -> Self {
        Self { ledger, stale_after }
    }
}

#[async_trait]
impl Task for ReportStaleJobsTask {
    fn name(&self) -> &'static str {
        REPORT_STALE_JOBS
    }

    async fn run(&self, ctx: &mut TaskContext, _args: JsonValue) -> Result<JsonValue, TaskError> {
        let threshold = Utc::now() - self.stale_after;
        let stale = self
            .ledger
            .in_progress_started_before(threshold)
            .await
            .map_err(anyhow::Error::from)?;

        for job in &stale {
            warn!(
                job_id = %job.id(),
                task_id = %job.task_id(),
                task_name = %job.task_name(),
                attempt = ?job.attempt(),
                start_time = ?job.start_time(),
                "job stuck in progress"
            );
        }
        if stale.is_empty() {
            info!(task_id = %ctx.task_id, "no stale jobs");
        }

        let ids: Vec<&str> = stale.iter().map(|job| job.task_id().as_str()).collect();
        Ok(json!({ "stale": ids }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobLedger, JobStatus, NewJob};

    fn ctx(name: &str) -> TaskContext {
        TaskContext {
            task_id: TaskId::new(format!("{name}-test")),
            task_name: name.to_string(),
            attempt: 1,
            owner: system_owner(),
            enqueue_time: Utc::now(),
        }
    }

    async fn finished_job(ledger: &InMemoryJobLedger, id: &str, finish: DateTime<Utc>) {
        let job = ledger
            .enqueue(NewJob {
                task_id: TaskId::new(id),
                task_name: "deploy_range".into(),
                owner: UserId::new(),
                enqueue_time: finish - Duration::minutes(5),
            })
            .await
            .unwrap();
        let job = ledger.mark_in_progress(&job, finish - Duration::minutes(1), 1).await.unwrap();
        ledger.mark_complete(&job, finish, json!({})).await.unwrap();
    }

    #[test]
    fn scheduled_ids_collide_within_a_slot() {
        let interval = Duration::hours(1);
        let t = DateTime::parse_from_rfc3339("2024-05-01T12:10:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(
            scheduled_task_id(PURGE_JOBS, t, interval),
            scheduled_task_id(PURGE_JOBS, t + Duration::minutes(40), interval)
        );
        assert_ne!(
            scheduled_task_id(PURGE_JOBS, t, interval),
            scheduled_task_id(PURGE_JOBS, t + Duration::minutes(50), interval)
        );
    }

    #[tokio::test]
    async fn purge_uses_retention_window() {
        let ledger = Arc::new(InMemoryJobLedger::new());
        finished_job(&ledger, "old", Utc::now() - Duration::days(40)).await;
        finished_job(&ledger, "new", Utc::now() - Duration::days(1)).await;

        let task = PurgeJobsTask::new(ledger.clone(), Duration::days(30));
        let out = task.run(&mut ctx(PURGE_JOBS), JsonValue::Null).await.unwrap();

        assert_eq!(out["purged"], 1);
        let left = ledger.query(None, Some(JobStatus::Complete)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].task_id().as_str(), "new");
    }

    #[tokio::test]
    async fn purge_rejects_non_utc_cutoff() {
        let ledger = Arc::new(InMemoryJobLedger::new());
        let task = PurgeJobsTask::new(ledger, Duration::days(30));

        let naive = task
            .run(&mut ctx(PURGE_JOBS), json!({"cutoff": "2024-05-01T00:00:00"}))
            .await;
        assert!(matches!(naive, Err(TaskError::InvalidArgs(_))));

        let offset = task
            .run(&mut ctx(PURGE_JOBS), json!({"cutoff": "2024-05-01T00:00:00+02:00"}))
            .await;
        assert!(matches!(offset, Err(TaskError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn stale_report_lists_long_running_jobs() {
        let ledger = Arc::new(InMemoryJobLedger::new());
        let job = ledger
            .enqueue(NewJob {
                task_id: TaskId::new("stuck"),
                task_name: "deploy_range".into(),
                owner: UserId::new(),
                enqueue_time: Utc::now() - Duration::hours(3),
            })
            .await
            .unwrap();
        ledger
            .mark_in_progress(&job, Utc::now() - Duration::hours(2), 1)
            .await
            .unwrap();

        let task = ReportStaleJobsTask::new(ledger.clone(), Duration::minutes(40));
        let out = task.run(&mut ctx(REPORT_STALE_JOBS), JsonValue::Null).await.unwrap();
        assert_eq!(out["stale"], json!(["stuck"]));

        // Reporting never repairs.
        let still = ledger.find(&"stuck".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(still.status(), JobStatus::InProgress);
    }
}
