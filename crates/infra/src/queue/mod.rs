//! Task queue: at-least-once delivery of task invocations to workers.
//!
//! ## Components
//!
//! - `TaskQueue`: enqueue/dequeue/ack plus a short-lived result store
//! - `InMemoryTaskQueue`: single-process implementation for tests and dev
//! - `RedisTaskQueue` (feature `redis`): shared queue for several worker processes
//!
//! The queue owns delivery bookkeeping (attempt counts, leases, results). The
//! job ledger is a separate, longer-lived record written by the runner hooks.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use openlabs_core::UserId;

use crate::jobs::TaskId;

pub use memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisTaskQueue;

/// A task invocation submitted to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub task_name: String,
    pub args: JsonValue,
    pub owner: UserId,
}

/// What a worker receives from `dequeue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub task_id: TaskId,
    pub task_name: String,
    pub args: JsonValue,
    pub owner: UserId,
    pub enqueue_time: DateTime<Utc>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(JsonValue),
    Failure(String),
}

/// Outcome of one task execution, kept for a bounded TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    /// Delivery attempt that produced this result.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit a task. Returns `None` when a task with the same id is already
    /// queued, running, or has a retained result.
    async fn enqueue(&self, request: TaskRequest) -> Result<Option<TaskId>, QueueError>;

    /// Wait up to `wait` for the next delivery.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn store_result(&self, task_id: &TaskId, result: &TaskResult) -> Result<(), QueueError>;

    async fn get_result(&self, task_id: &TaskId) -> Result<Option<TaskResult>, QueueError>;

    /// Finish a delivery; it will not be redelivered.
    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError>;

    /// Put deliveries whose lease ran out (crashed worker) back on the queue.
    async fn recover_expired(&self) -> Result<usize, QueueError>;
}
