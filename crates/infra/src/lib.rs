//! Infrastructure layer: job ledger, task queue, runner, provisioning, stores.
//!
//! ## Layout
//!
//! - `jobs`: the job ledger state machine, its stores and the runner hooks
//! - `queue`: at-least-once task delivery (in-memory, Redis)
//! - `provisioning`: provider plugins and the one-shot provisioning operation
//! - `stores`: blueprint, credential and deployed range stores
//! - `tasks`: task bodies (deploy, destroy, maintenance)
//! - `submission`: request-side gateway that validates and enqueues
//! - `config`, `db`: worker wiring

pub mod config;
pub mod db;
pub mod jobs;
pub mod provisioning;
pub mod queue;
pub mod stores;
pub mod submission;
pub mod tasks;

pub use config::{ConfigError, WorkerConfig};
pub use submission::{DeployRequest, LedgerWrite, Submission, SubmissionGateway, SubmitError};
