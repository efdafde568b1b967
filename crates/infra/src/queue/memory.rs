//! In-memory task queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::jobs::TaskId;

use super::{Delivery, QueueError, TaskQueue, TaskRequest, TaskResult};

#[derive(Debug)]
struct QueuedTask {
    request: TaskRequest,
    enqueue_time: DateTime<Utc>,
    attempts: u32,
    in_flight: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    tasks: HashMap<TaskId, QueuedTask>,
    results: HashMap<TaskId, (TaskResult, DateTime<Utc>)>,
}

/// Single-process queue. Leases never expire on their own; tests simulate a
/// crashed worker with [`InMemoryTaskQueue::requeue_in_flight`].
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    result_ttl: chrono::Duration,
}

impl InMemoryTaskQueue {
    pub fn new(result_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            result_ttl: chrono::Duration::from_std(result_ttl)
                .unwrap_or(chrono::Duration::hours(24)),
        }
    }

    /// Return every in-flight delivery to the pending queue.
    pub async fn requeue_in_flight(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut requeued = Vec::new();
        for (task_id, task) in state.tasks.iter_mut() {
            if task.in_flight {
                task.in_flight = false;
                requeued.push(task_id.clone());
            }
        }
        let count = requeued.len();
        state.pending.extend(requeued);
        drop(state);
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    /// Number of tasks waiting for a worker.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, request: TaskRequest) -> Result<Option<TaskId>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let has_result = state
            .results
            .get(&request.task_id)
            .is_some_and(|(_, expires)| *expires > now);
        if has_result || state.tasks.contains_key(&request.task_id) {
            return Ok(None);
        }

        let task_id = request.task_id.clone();
        state.tasks.insert(
            task_id.clone(),
            QueuedTask {
                request,
                enqueue_time: now,
                attempts: 0,
                in_flight: false,
            },
        );
        state.pending.push_back(task_id.clone());
        drop(state);
        self.notify.notify_one();
        Ok(Some(task_id))
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                while let Some(task_id) = state.pending.pop_front() {
                    let Some(task) = state.tasks.get_mut(&task_id) else {
                        continue;
                    };
                    task.attempts += 1;
                    task.in_flight = true;
                    return Ok(Some(Delivery {
                        task_id,
                        task_name: task.request.task_name.clone(),
                        args: task.request.args.clone(),
                        owner: task.request.owner,
                        enqueue_time: task.enqueue_time,
                        attempt: task.attempts,
                    }));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn store_result(&self, task_id: &TaskId, result: &TaskResult) -> Result<(), QueueError> {
        let expires = Utc::now() + self.result_ttl;
        self.state
            .lock()
            .await
            .results
            .insert(task_id.clone(), (result.clone(), expires));
        Ok(())
    }

    async fn get_result(&self, task_id: &TaskId) -> Result<Option<TaskResult>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.results.retain(|_, (_, expires)| *expires > now);
        Ok(state.results.get(task_id).map(|(result, _)| result.clone()))
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.tasks.remove(task_id);
        state.pending.retain(|id| id != task_id);
        Ok(())
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskOutcome;
    use openlabs_core::UserId;
    use serde_json::json;

    fn request(id: &str) -> TaskRequest {
        TaskRequest {
            task_id: TaskId::new(id),
            task_name: "deploy_range".to_string(),
            args: json!({"n": 1}),
            owner: UserId::new(),
        }
    }

    #[tokio::test]
    async fn fifo_delivery_with_attempt_counting() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(request("a")).await.unwrap();
        queue.enqueue(request("b")).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.task_id.as_str(), "a");
        assert_eq!(first.attempt, 1);

        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.task_id.as_str(), "b");
        assert!(queue.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_rejected_until_result_expires() {
        let queue = InMemoryTaskQueue::default();
        assert!(queue.enqueue(request("a")).await.unwrap().is_some());
        assert!(queue.enqueue(request("a")).await.unwrap().is_none());

        let delivery = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let now = Utc::now();
        queue
            .store_result(
                &delivery.task_id,
                &TaskResult {
                    outcome: TaskOutcome::Success(json!(null)),
                    attempt: delivery.attempt,
                    started_at: now,
                    finished_at: now,
                },
            )
            .await
            .unwrap();
        queue.ack(&delivery.task_id).await.unwrap();

        // Acked, but the retained result still blocks resubmission.
        assert!(queue.enqueue(request("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_results_are_dropped() {
        let queue = InMemoryTaskQueue::new(Duration::ZERO);
        let now = Utc::now();
        let id = TaskId::new("a");
        queue
            .store_result(
                &id,
                &TaskResult {
                    outcome: TaskOutcome::Failure("boom".into()),
                    attempt: 1,
                    started_at: now,
                    finished_at: now,
                },
            )
            .await
            .unwrap();
        assert!(queue.get_result(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeued_delivery_has_higher_attempt() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(request("a")).await.unwrap();
        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(queue.requeue_in_flight().await, 1);
        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.task_id, first.task_id);
        assert_eq!(again.attempt, 2);
        assert_eq!(again.enqueue_time, first.enqueue_time);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(InMemoryTaskQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(request("late")).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.task_id.as_str(), "late");
    }
}
