//! In-process broker with the same state transitions as the Redis broker

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Broker, QueueStats};
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskMessage, TaskState};

#[derive(Debug, Default)]
struct QueueSets {
    pending: VecDeque<TaskId>,
    active: HashSet<TaskId>,
    scheduled: HashSet<TaskId>,
    retry: HashSet<TaskId>,
    archived: HashSet<TaskId>,
    completed: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskMessage>,
    queues: HashMap<String, QueueSets>,
    deliveries: HashMap<TaskId, u32>,
    writes: u64,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> TaskResult<()> {
        if self.closed {
            return Err(TaskError::connection("memory broker is closed"));
        }
        Ok(())
    }

    fn queue(&mut self, name: &str) -> &mut QueueSets {
        self.queues.entry(name.to_string()).or_default()
    }

    fn store(&mut self, msg: &TaskMessage, state: TaskState) {
        let mut stored = msg.clone();
        stored.state = state;
        self.tasks.insert(msg.id, stored);
        self.writes += 1;
    }
}

/// Broker that keeps every message in memory. Nothing survives the process.
///
/// Records are never evicted: completed and archived messages stay in the
/// task map for the broker's lifetime, with no retention window.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state-changing writes performed so far
    pub async fn writes(&self) -> u64 {
        self.inner.lock().await.writes
    }

    /// How many times a message has been handed out by `dequeue`
    pub async fn deliveries(&self, id: TaskId) -> u32 {
        self.inner
            .lock()
            .await
            .deliveries
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Forward scheduled and retry messages as if the clock read `now`
    pub async fn forward_ready_at(&self, queues: &[String], now: DateTime<Utc>) -> TaskResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        let mut moved = 0;
        for queue_name in queues {
            let Inner {
                tasks,
                queues: queue_map,
                ..
            } = &mut *inner;
            let Some(queue) = queue_map.get_mut(queue_name) else {
                continue;
            };

            let mut ready: Vec<TaskId> = queue
                .scheduled
                .iter()
                .chain(queue.retry.iter())
                .filter(|id| tasks.get(*id).map(|m| m.is_ready(now)).unwrap_or(false))
                .copied()
                .collect();
            ready.sort_by_key(|id| tasks.get(id).and_then(|m| m.process_at));

            for id in ready {
                queue.scheduled.remove(&id);
                queue.retry.remove(&id);
                queue.pending.push_back(id);
                if let Some(msg) = tasks.get_mut(&id) {
                    msg.state = TaskState::Pending;
                }
                moved += 1;
                debug!("Forwarded task {} to queue {}", id, queue_name);
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> TaskResult<()> {
        self.inner.lock().await.check_open()
    }

    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        if inner.tasks.contains_key(&msg.id) {
            return Err(TaskError::enqueue(format!("task {} already exists", msg.id)));
        }
        inner.store(msg, TaskState::Pending);
        inner.queue(&msg.queue).pending.push_back(msg.id);
        Ok(())
    }

    async fn schedule(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        if msg.process_at.is_none() {
            return Err(TaskError::enqueue("scheduled task without process_at"));
        }
        if inner.tasks.contains_key(&msg.id) {
            return Err(TaskError::enqueue(format!("task {} already exists", msg.id)));
        }
        inner.store(msg, TaskState::Scheduled);
        inner.queue(&msg.queue).scheduled.insert(msg.id);
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> TaskResult<Option<TaskMessage>> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        for queue_name in queues {
            let next = inner
                .queues
                .get_mut(queue_name)
                .and_then(|q| q.pending.pop_front());
            let Some(id) = next else {
                continue;
            };
            inner.queue(queue_name).active.insert(id);
            *inner.deliveries.entry(id).or_insert(0) += 1;
            let msg = inner
                .tasks
                .get_mut(&id)
                .ok_or_else(|| {
                    TaskError::queue_operation("dequeue", format!("missing record for {}", id))
                })?;
            msg.state = TaskState::Active;
            return Ok(Some(msg.clone()));
        }
        Ok(None)
    }

    async fn done(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let queue = inner.queue(&msg.queue);
        queue.active.remove(&msg.id);
        queue.completed += 1;
        inner.store(msg, TaskState::Completed);
        Ok(())
    }

    async fn retry(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        if msg.process_at.is_none() {
            return Err(TaskError::queue_operation("retry", "missing retry time"));
        }
        let queue = inner.queue(&msg.queue);
        queue.active.remove(&msg.id);
        queue.retry.insert(msg.id);
        inner.store(msg, TaskState::Retry);
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let queue = inner.queue(&msg.queue);
        queue.active.remove(&msg.id);
        queue.archived.insert(msg.id);
        inner.store(msg, TaskState::Archived);
        Ok(())
    }

    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let queue = inner.queue(&msg.queue);
        queue.active.remove(&msg.id);
        queue.pending.push_front(msg.id);
        inner.store(msg, TaskState::Pending);
        Ok(())
    }

    async fn forward_ready(&self, queues: &[String]) -> TaskResult<u64> {
        self.forward_ready_at(queues, Utc::now()).await
    }

    async fn get_task(&self, id: TaskId) -> TaskResult<Option<TaskMessage>> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner
            .queues
            .get(queue)
            .map(|q| QueueStats {
                pending: q.pending.len() as u64,
                active: q.active.len() as u64,
                scheduled: q.scheduled.len() as u64,
                retry: q.retry.len() as u64,
                archived: q.archived.len() as u64,
                completed: q.completed,
            })
            .unwrap_or_default())
    }

    async fn close(&self) -> TaskResult<()> {
        self.inner.lock().await.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::time::Duration;

    fn message(queue: &str) -> TaskMessage {
        let task = Task::new("email:delivery", b"{}".to_vec());
        TaskMessage::new(&task, queue.to_string(), 3, Duration::from_secs(30))
    }

    fn queues() -> Vec<String> {
        vec!["default".to_string()]
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_exclusive() {
        let broker = MemoryBroker::new();
        let first = message("default");
        let second = message("default");
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();

        let got = broker.dequeue(&queues()).await.unwrap().unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(got.state, TaskState::Active);
        let got = broker.dequeue(&queues()).await.unwrap().unwrap();
        assert_eq!(got.id, second.id);
        assert!(broker.dequeue(&queues()).await.unwrap().is_none());

        let stats = broker.queue_stats("default").await.unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_scheduled_message_waits_for_its_time() {
        let broker = MemoryBroker::new();
        let now = Utc::now();
        let mut msg = message("default");
        msg.process_at = Some(now + chrono::Duration::seconds(5));
        broker.schedule(&msg).await.unwrap();

        assert_eq!(broker.forward_ready_at(&queues(), now).await.unwrap(), 0);
        assert!(broker.dequeue(&queues()).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(broker.forward_ready_at(&queues(), later).await.unwrap(), 1);
        assert_eq!(broker.dequeue(&queues()).await.unwrap().unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn test_archived_message_is_never_forwarded() {
        let broker = MemoryBroker::new();
        let msg = message("default");
        broker.enqueue(&msg).await.unwrap();
        let mut leased = broker.dequeue(&queues()).await.unwrap().unwrap();
        leased.mark_archived("bad payload");
        broker.archive(&leased).await.unwrap();

        let far_future = Utc::now() + chrono::Duration::days(365);
        assert_eq!(broker.forward_ready_at(&queues(), far_future).await.unwrap(), 0);
        assert!(broker.dequeue(&queues()).await.unwrap().is_none());
        assert_eq!(broker.deliveries(msg.id).await, 1);

        let stored = broker.get_task(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Archived);
        assert_eq!(stored.last_error.as_deref(), Some("bad payload"));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front() {
        let broker = MemoryBroker::new();
        let first = message("default");
        let second = message("default");
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();

        let leased = broker.dequeue(&queues()).await.unwrap().unwrap();
        broker.requeue(&leased).await.unwrap();
        assert_eq!(broker.dequeue(&queues()).await.unwrap().unwrap().id, first.id);
        assert_eq!(broker.deliveries(first.id).await, 2);
    }

    #[tokio::test]
    async fn test_closed_broker_reports_connection_error() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let err = broker.enqueue(&message("default")).await.unwrap_err();
        assert!(matches!(err, TaskError::Connection { .. }));
        assert_eq!(broker.writes().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let broker = MemoryBroker::new();
        let msg = message("default");
        broker.enqueue(&msg).await.unwrap();
        let err = broker.enqueue(&msg).await.unwrap_err();
        assert!(matches!(err, TaskError::Enqueue { .. }));
    }
}
