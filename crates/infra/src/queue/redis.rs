//! Redis-backed task queue (at-least-once delivery across worker processes).
//!
//! ## Keys
//!
//! - `{prefix}:pending`: list of task ids waiting for a worker
//! - `{prefix}:in_flight`: list of task ids currently delivered
//! - `{prefix}:task:{id}`: JSON task payload, written with `SET NX` (dedup)
//! - `{prefix}:attempts:{id}`: delivery counter, `INCR` on every dequeue
//! - `{prefix}:lease:{id}`: present while a worker holds the delivery (`PX` expiry)
//! - `{prefix}:result:{id}`: JSON `TaskResult`, expires after the result TTL
//!
//! A claim script moves an id from `pending` to `in_flight`, writes its lease
//! and bumps its attempt counter in one atomic step, so recovery never sees an
//! in-flight id without a lease. When a worker dies mid-job its lease expires
//! and [`RedisTaskQueue::recover_expired`] moves the id back to `pending`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use openlabs_core::UserId;

use crate::jobs::TaskId;

use super::{Delivery, QueueError, TaskQueue, TaskRequest, TaskResult};

/// Default key prefix
const DEFAULT_PREFIX: &str = "openlabs:queue";

/// Scripts cannot block, so an empty queue is re-checked at this interval.
const CLAIM_POLL: Duration = Duration::from_millis(100);

/// KEYS: pending, in_flight. ARGV: key prefix, lease millis.
/// Returns `{id, attempt, payload}` or nil when nothing is pending.
const CLAIM_SCRIPT: &str = r"
local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT')
if not id then
  return false
end
redis.call('SET', ARGV[1] .. ':lease:' .. id, '1', 'PX', ARGV[2])
local attempt = redis.call('INCR', ARGV[1] .. ':attempts:' .. id)
local payload = redis.call('GET', ARGV[1] .. ':task:' .. id)
return {id, attempt, payload}
";

type Claimed = (String, u32, Option<String>);

/// Stored task payload
#[derive(Debug, Serialize, Deserialize)]
struct StoredTask {
    task_name: String,
    args: JsonValue,
    owner: UserId,
    enqueue_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RedisTaskQueue {
    client: Arc<redis::Client>,
    prefix: String,
    lease: Duration,
    result_ttl: Duration,
}

impl RedisTaskQueue {
    /// Create a queue client.
    ///
    /// * `lease` - how long a delivery may run before it counts as abandoned;
    ///   set it above the job timeout
    /// * `result_ttl` - how long task results are kept
    pub fn new(
        redis_url: impl AsRef<str>,
        lease: Duration,
        result_ttl: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            lease,
            result_ttl,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn in_flight_key(&self) -> String {
        format!("{}:in_flight", self.prefix)
    }

    fn task_key(&self, task_id: &TaskId) -> String {
        format!("{}:task:{task_id}", self.prefix)
    }

    fn attempts_key(&self, task_id: &TaskId) -> String {
        format!("{}:attempts:{task_id}", self.prefix)
    }

    fn lease_key(&self, task_id: &TaskId) -> String {
        format!("{}:lease:{task_id}", self.prefix)
    }

    fn result_key(&self, task_id: &TaskId) -> String {
        format!("{}:result:{task_id}", self.prefix)
    }
}

fn command_error(e: redis::RedisError) -> QueueError {
    QueueError::Command(e.to_string())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    #[instrument(skip(self, request), fields(task_id = %request.task_id, task_name = %request.task_name), err)]
    async fn enqueue(&self, request: TaskRequest) -> Result<Option<TaskId>, QueueError> {
        let mut conn = self.connection().await?;

        let has_result: bool = conn
            .exists(self.result_key(&request.task_id))
            .await
            .map_err(command_error)?;
        if has_result {
            return Ok(None);
        }

        let payload = serde_json::to_string(&StoredTask {
            task_name: request.task_name,
            args: request.args,
            owner: request.owner,
            enqueue_time: Utc::now(),
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;

        // SET NX returns nil when the key already exists.
        let created: Option<String> = redis::cmd("SET")
            .arg(self.task_key(&request.task_id))
            .arg(&payload)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        if created.is_none() {
            debug!("task already queued");
            return Ok(None);
        }

        let _: i64 = conn
            .lpush(self.pending_key(), request.task_id.as_str())
            .await
            .map_err(command_error)?;
        Ok(Some(request.task_id))
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let claim = redis::Script::new(CLAIM_SCRIPT);
        let deadline = tokio::time::Instant::now() + wait;

        let (raw_id, attempt, payload) = loop {
            let claimed: Option<Claimed> = claim
                .key(self.pending_key())
                .key(self.in_flight_key())
                .arg(&self.prefix)
                .arg(millis(self.lease))
                .invoke_async(&mut conn)
                .await
                .map_err(command_error)?;
            if let Some(claimed) = claimed {
                break claimed;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL.min(deadline - now)).await;
        };
        let task_id = TaskId::new(raw_id);

        let Some(payload) = payload else {
            warn!(task_id = %task_id, "in-flight task has no payload; dropping");
            self.ack(&task_id).await?;
            return Ok(None);
        };
        let stored: StoredTask = serde_json::from_str(&payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        Ok(Some(Delivery {
            task_id,
            task_name: stored.task_name,
            args: stored.args,
            owner: stored.owner,
            enqueue_time: stored.enqueue_time,
            attempt,
        }))
    }

    #[instrument(skip(self, result), err)]
    async fn store_result(&self, task_id: &TaskId, result: &TaskResult) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(result).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(self.result_key(task_id), payload, self.result_ttl.as_secs().max(1))
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn get_result(&self, task_id: &TaskId) -> Result<Option<TaskResult>, QueueError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get(self.result_key(task_id)).await.map_err(command_error)?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(|e| QueueError::Serialization(e.to_string())))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.in_flight_key(), 0, task_id.as_str())
            .ignore()
            .del(self.task_key(task_id))
            .ignore()
            .del(self.attempts_key(task_id))
            .ignore()
            .del(self.lease_key(task_id))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let in_flight: Vec<String> = conn
            .lrange(self.in_flight_key(), 0, -1)
            .await
            .map_err(command_error)?;

        let mut recovered = 0;
        for raw_id in in_flight {
            let task_id = TaskId::new(raw_id);
            let leased: bool = conn.exists(self.lease_key(&task_id)).await.map_err(command_error)?;
            if leased {
                continue;
            }
            // LREM first: if another worker already recovered it, skip the push.
            let removed: i64 = conn
                .lrem(self.in_flight_key(), 1, task_id.as_str())
                .await
                .map_err(command_error)?;
            if removed == 0 {
                continue;
            }
            let _: i64 = conn
                .lpush(self.pending_key(), task_id.as_str())
                .await
                .map_err(command_error)?;
            warn!(task_id = %task_id, "lease expired; task re-queued");
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Runs against a live server only when `OPENLABS_TEST_REDIS_URL` is set.
    fn live_queue() -> Option<RedisTaskQueue> {
        let url = std::env::var("OPENLABS_TEST_REDIS_URL").ok()?;
        let prefix = format!("openlabs:test:{}", uuid::Uuid::new_v4().simple());
        Some(
            RedisTaskQueue::new(url, Duration::from_secs(60), Duration::from_secs(60))
                .unwrap()
                .with_prefix(prefix),
        )
    }

    #[tokio::test]
    async fn claimed_delivery_is_leased_before_recovery_can_see_it() {
        let Some(queue) = live_queue() else {
            return;
        };
        let task_id = TaskId::new("claim-1");
        queue
            .enqueue(TaskRequest {
                task_id: task_id.clone(),
                task_name: "echo".into(),
                args: json!({"x": 1}),
                owner: UserId::new(),
            })
            .await
            .unwrap();

        let delivery = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.task_id, task_id);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.args, json!({"x": 1}));

        let mut conn = queue.connection().await.unwrap();
        let leased: bool = conn.exists(queue.lease_key(&task_id)).await.unwrap();
        assert!(leased);
        assert_eq!(queue.recover_expired().await.unwrap(), 0);

        queue.ack(&task_id).await.unwrap();
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());
    }
}
