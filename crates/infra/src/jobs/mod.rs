//! Job ledger and runner.
//!
//! ## Components
//!
//! - `Job`: validated ledger row with forward-only transitions
//! - `JobLedger`: persistence (in-memory or Postgres) with compare-and-set writes
//! - `JobRunner`: executes queue deliveries and mirrors them into the ledger

pub mod postgres;
pub mod runner;
pub mod store;
pub mod types;

pub use postgres::PostgresJobLedger;
pub use runner::{JobRunner, JobRunnerHandle, RunnerConfig, RunnerStats, Task, TaskContext, TaskError};
pub use store::{InMemoryJobLedger, JobLedger, LedgerError, NewJob};
pub use types::{Job, JobError, JobId, JobLookup, JobParts, JobStatus, ReportedStatus, TaskId};
