//! Client interface for submitting tasks to the broker

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskInfo, TaskMessage, TaskState};

/// Per-submission options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOption {
    /// Not eligible for dequeue before now + duration
    ProcessIn(Duration),
    /// Not eligible for dequeue before the given time
    ProcessAt(DateTime<Utc>),
    /// Place the task on a specific queue
    Queue(String),
    /// Retry ceiling for retryable failures
    MaxRetry(u32),
    /// Maximum execution time of one attempt
    Timeout(Duration),
}

/// Defaults applied when a submission carries no explicit option
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_queue: String,
    pub max_retry: u32,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            max_retry: 25,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Client for submitting tasks to the broker
#[derive(Clone)]
pub struct TaskClient {
    broker: Arc<dyn Broker>,
    config: ClientConfig,
}

impl TaskClient {
    /// Create a client over an existing broker with default settings
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, ClientConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, config: ClientConfig) -> Self {
        Self { broker, config }
    }

    /// Submit a task.
    ///
    /// The broker records the task before this returns. Enqueue is never
    /// retried here; the caller decides what to do with an error.
    pub async fn enqueue(&self, task: &Task, options: &[EnqueueOption]) -> TaskResult<TaskInfo> {
        if task.type_name().trim().is_empty() {
            return Err(TaskError::enqueue("task type name cannot be empty"));
        }

        let mut queue = self.config.default_queue.clone();
        let mut max_retry = self.config.max_retry;
        let mut timeout = self.config.timeout;
        let mut process_at = None;

        for option in options {
            match option {
                EnqueueOption::ProcessIn(delay) => {
                    let delay = chrono::Duration::from_std(*delay)
                        .map_err(|e| TaskError::enqueue(format!("invalid delay: {}", e)))?;
                    process_at = Some(Utc::now() + delay);
                }
                EnqueueOption::ProcessAt(at) => process_at = Some(*at),
                EnqueueOption::Queue(name) => {
                    if name.trim().is_empty() {
                        return Err(TaskError::enqueue("queue name cannot be empty"));
                    }
                    queue = name.clone();
                }
                EnqueueOption::MaxRetry(n) => max_retry = *n,
                EnqueueOption::Timeout(t) => timeout = *t,
            }
        }

        let mut msg = TaskMessage::new(task, queue, max_retry, timeout);

        match process_at {
            Some(at) if at > Utc::now() => {
                msg.process_at = Some(at);
                msg.state = TaskState::Scheduled;
                self.broker.schedule(&msg).await?;
            }
            _ => {
                self.broker.enqueue(&msg).await?;
            }
        }

        debug!("Submitted task {} ({}) to queue {}", msg.id, msg.type_name, msg.queue);
        Ok(msg.info())
    }

    /// Get access to the underlying broker for inspection
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn client() -> (Arc<MemoryBroker>, TaskClient) {
        let broker = Arc::new(MemoryBroker::new());
        let client = TaskClient::new(broker.clone());
        (broker, client)
    }

    #[tokio::test]
    async fn test_immediate_enqueue_lands_on_default_queue() {
        let (broker, client) = client();
        let task = Task::new("email:delivery", b"{}".to_vec());

        let info = client.enqueue(&task, &[]).await.unwrap();
        assert_eq!(info.queue, "default");
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.max_retry, 25);
        assert!(info.process_at.is_none());

        let stats = broker.queue_stats("default").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(broker.writes().await, 1);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_is_scheduled() {
        let (broker, client) = client();
        let task = Task::new("data:process", b"{}".to_vec());
        let before = Utc::now();

        let info = client
            .enqueue(&task, &[EnqueueOption::ProcessIn(Duration::from_secs(5))])
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Scheduled);
        let process_at = info.process_at.unwrap();
        assert!(process_at >= before + chrono::Duration::seconds(5));

        let queues = vec!["default".to_string()];
        assert!(broker.dequeue(&queues).await.unwrap().is_none());
        assert_eq!(broker.queue_stats("default").await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_process_at_in_past_is_immediate() {
        let (_broker, client) = client();
        let task = Task::new("t", Vec::new());
        let past = Utc::now() - chrono::Duration::seconds(10);

        let info = client
            .enqueue(&task, &[EnqueueOption::ProcessAt(past)])
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_options_override_defaults() {
        let (broker, client) = client();
        let task = Task::new("t", Vec::new());

        let info = client
            .enqueue(
                &task,
                &[
                    EnqueueOption::Queue("critical".to_string()),
                    EnqueueOption::MaxRetry(1),
                    EnqueueOption::Timeout(Duration::from_secs(9)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(info.queue, "critical");
        assert_eq!(info.max_retry, 1);
        assert_eq!(info.timeout_ms, 9000);
        assert_eq!(broker.queue_stats("critical").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_empty_type_is_rejected_before_the_broker() {
        let (broker, client) = client();
        let err = client.enqueue(&Task::new("", Vec::new()), &[]).await.unwrap_err();
        assert!(matches!(err, TaskError::Enqueue { .. }));
        assert_eq!(broker.writes().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_a_connection_error() {
        let (broker, client) = client();
        broker.close().await.unwrap();
        let err = client
            .enqueue(&Task::new("t", Vec::new()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Connection { .. }));
    }
}
