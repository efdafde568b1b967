//! Postgres-backed job ledger.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError |
//! |------------|----------------------|-------------|
//! | Database (check constraint violation) | `23514` | `Storage` (row would break a job invariant) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! A compare-and-set transition that matches no row is reported as `Conflict`,
//! never as a SQLx error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use openlabs_core::UserId;

use super::store::{JobLedger, LedgerError, NewJob};
use super::types::{Job, JobId, JobLookup, JobParts, JobStatus, TaskId};

const JOB_COLUMNS: &str = "id, task_id, task_name, attempt, enqueue_time, start_time, finish_time, \
                           status, result, error_message, owner_id";

/// Postgres job ledger.
///
/// `task_id` carries a unique constraint, which makes `enqueue` an
/// `INSERT .. ON CONFLICT DO NOTHING` followed by a read of whichever row won.
/// Transitions are a single `UPDATE` guarded on the previous status and attempt.
#[derive(Debug, Clone)]
pub struct PostgresJobLedger {
    pool: Arc<PgPool>,
}

impl PostgresJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_by_task_id(&self, task_id: &TaskId) -> Result<Option<Job>, LedgerError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = $1");
        let row = sqlx::query(&sql)
            .bind(task_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_by_task_id", e))?;
        row.map(|row| decode_job(&row)).transpose()
    }
}

#[async_trait]
impl JobLedger for PostgresJobLedger {
    #[instrument(skip(self, job), fields(task_id = %job.task_id, task_name = %job.task_name), err)]
    async fn enqueue(&self, job: NewJob) -> Result<Job, LedgerError> {
        // Validate before touching the database.
        Job::queued(
            JobId(0),
            job.task_id.clone(),
            job.task_name.clone(),
            job.owner,
            job.enqueue_time,
        )?;

        sqlx::query(
            r#"
            INSERT INTO jobs (task_id, task_name, enqueue_time, status, owner_id)
            VALUES ($1, $2, $3, 'queued', $4)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(job.task_id.as_str())
        .bind(&job.task_name)
        .bind(job.enqueue_time)
        .bind(job.owner.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        self.fetch_by_task_id(&job.task_id)
            .await?
            .ok_or(LedgerError::NotFound(job.task_id))
    }

    #[instrument(skip(self), err)]
    async fn find(&self, lookup: &JobLookup) -> Result<Option<Job>, LedgerError> {
        match lookup {
            JobLookup::TaskId(task_id) => self.fetch_by_task_id(task_id).await,
            JobLookup::Id(id) => {
                let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
                let row = sqlx::query(&sql)
                    .bind(id.0)
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("find", e))?;
                row.map(|row| decode_job(&row)).transpose()
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn query(
        &self,
        owner: Option<UserId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, LedgerError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::uuid IS NULL OR owner_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.map(|o| *o.as_uuid()))
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(
        skip(self, previous, next),
        fields(
            task_id = %previous.task_id(),
            from = %previous.status(),
            to = %next.status(),
        ),
        err
    )]
    async fn write_transition(&self, previous: &Job, next: &Job) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                attempt = $4,
                start_time = $5,
                finish_time = $6,
                result = $7,
                error_message = $8
            WHERE id = $1
              AND status = $2
              AND attempt IS NOT DISTINCT FROM $9
            "#,
        )
        .bind(previous.id().0)
        .bind(previous.status().as_str())
        .bind(next.status().as_str())
        .bind(next.attempt().map(attempt_to_db))
        .bind(next.start_time())
        .bind(next.finish_time())
        .bind(next.result().cloned())
        .bind(next.error_message())
        .bind(previous.attempt().map(attempt_to_db))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write_transition", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.find(&JobLookup::Id(previous.id())).await? {
            Some(_) => Err(LedgerError::Conflict(previous.task_id().clone())),
            None => Err(LedgerError::NotFound(previous.task_id().clone())),
        }
    }

    #[instrument(skip(self), fields(cutoff = %cutoff), err)]
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('complete', 'failed')
              AND finish_time < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_terminal_before", e))?;
        Ok(deleted.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn in_progress_started_before(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, LedgerError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'in_progress' AND start_time < $1 \
             ORDER BY start_time ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(started_before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("in_progress_started_before", e))?;
        rows.iter().map(decode_job).collect()
    }
}

fn attempt_to_db(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

/// Raw `jobs` row.
struct JobRow {
    id: i64,
    task_id: String,
    task_name: String,
    attempt: Option<i32>,
    enqueue_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    status: String,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    owner_id: Uuid,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            task_name: row.try_get("task_name")?,
            attempt: row.try_get("attempt")?,
            enqueue_time: row.try_get("enqueue_time")?,
            start_time: row.try_get("start_time")?,
            finish_time: row.try_get("finish_time")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            owner_id: row.try_get("owner_id")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = LedgerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| LedgerError::Storage(format!("job {}: {e}", row.id)))?;
        let attempt = row
            .attempt
            .map(|a| {
                u32::try_from(a)
                    .map_err(|_| LedgerError::Storage(format!("job {}: negative attempt {a}", row.id)))
            })
            .transpose()?;

        let parts = JobParts {
            id: JobId(row.id),
            task_id: TaskId::new(row.task_id),
            task_name: row.task_name,
            attempt,
            enqueue_time: row.enqueue_time.fixed_offset(),
            start_time: row.start_time.map(|ts| ts.fixed_offset()),
            finish_time: row.finish_time.map(|ts| ts.fixed_offset()),
            status,
            result: row.result,
            error_message: row.error_message,
            owner: UserId::from_uuid(row.owner_id),
        };
        Ok(Job::try_from(parts)?)
    }
}

fn decode_job(row: &PgRow) -> Result<Job, LedgerError> {
    let raw = JobRow::from_row(row)
        .map_err(|e| LedgerError::Storage(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(raw)
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                "23514" => LedgerError::Storage(format!(
                    "job invariant rejected by database in {operation}: {}",
                    db_err.message()
                )),
                _ => LedgerError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                )),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => LedgerError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
