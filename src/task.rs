//! Task data model: the producer-side task, the broker-side message and the submission record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for submitted tasks
pub type TaskId = Uuid;

/// Lifecycle state of a task inside the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for its eligibility time
    Scheduled,
    /// Eligible for dequeue
    Pending,
    /// Leased by a worker slot
    Active,
    /// Failed with a retryable error, waiting for backoff
    Retry,
    /// Handler succeeded
    Completed,
    /// Failed permanently; never dispatched again
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TaskState::Scheduled),
            "pending" => Some(TaskState::Pending),
            "active" => Some(TaskState::Active),
            "retry" => Some(TaskState::Retry),
            "completed" => Some(TaskState::Completed),
            "archived" => Some(TaskState::Archived),
            _ => None,
        }
    }
}

/// A typed unit of work: a handler selector plus an opaque payload.
///
/// Fields are private so a task cannot change once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    type_name: String,
    payload: Vec<u8>,
}

impl Task {
    pub fn new<S: Into<String>>(type_name: S, payload: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Backoff policy applied by the worker when a handler fails with a retryable error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay between retries in seconds
    pub retry_delay: u64,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
    /// Maximum delay between retries in seconds
    pub max_delay: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay: 5,
            exponential_backoff: true,
            max_delay: 300, // 5 minutes
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = if self.exponential_backoff {
            let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
            self.retry_delay.saturating_mul(factor).min(self.max_delay)
        } else {
            self.retry_delay
        };
        Duration::from_secs(secs)
    }
}

/// The record a broker stores for each submitted task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    /// Unique task identifier
    pub id: TaskId,
    /// Handler selector
    pub type_name: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Queue name
    pub queue: String,
    /// Retry ceiling
    pub max_retry: u32,
    /// Retries consumed so far
    pub retried: u32,
    /// Per-execution timeout in milliseconds, 0 for none
    pub timeout_ms: u64,
    /// When the task was submitted
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may be dequeued, if delayed
    pub process_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
    /// Current state
    pub state: TaskState,
}

/// Whole milliseconds, rounded up so a nonzero timeout never becomes "none"
fn timeout_millis(timeout: Duration) -> u64 {
    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    if timeout > Duration::from_millis(millis) {
        millis.saturating_add(1)
    } else {
        millis
    }
}

impl TaskMessage {
    /// Wrap a task for submission to `queue`
    pub fn new(task: &Task, queue: String, max_retry: u32, timeout: Duration) -> Self {
        Self {
            id: TaskId::new_v4(),
            type_name: task.type_name().to_string(),
            payload: task.payload().to_vec(),
            queue,
            max_retry,
            retried: 0,
            timeout_ms: timeout_millis(timeout),
            enqueued_at: Utc::now(),
            process_at: None,
            last_error: None,
            state: TaskState::Pending,
        }
    }

    /// Check if the task may be dequeued at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.process_at {
            Some(process_at) => now >= process_at,
            None => true,
        }
    }

    /// Check if another retry is allowed
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Record a retryable failure and schedule the next attempt
    pub fn mark_retry(&mut self, error: &str, retry_at: DateTime<Utc>) {
        self.retried += 1;
        self.state = TaskState::Retry;
        self.process_at = Some(retry_at);
        self.last_error = Some(error.to_string());
    }

    /// Record a terminal failure
    pub fn mark_archived(&mut self, error: &str) {
        self.state = TaskState::Archived;
        self.last_error = Some(error.to_string());
    }

    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
    }

    /// The submission record handed back to producers
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            queue: self.queue.clone(),
            type_name: self.type_name.clone(),
            state: self.state,
            process_at: self.process_at,
            max_retry: self.max_retry,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Submission record returned by the enqueue client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub queue: String,
    pub type_name: String,
    pub state: TaskState,
    pub process_at: Option<DateTime<Utc>>,
    pub max_retry: u32,
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TaskMessage {
        let task = Task::new("email:delivery", b"{}".to_vec());
        TaskMessage::new(&task, "default".to_string(), 2, Duration::from_secs(30))
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_secs(5));
        assert_eq!(config.delay_for(2), Duration::from_secs(10));
        assert_eq!(config.delay_for(3), Duration::from_secs(20));
        assert_eq!(config.delay_for(20), Duration::from_secs(300));
    }

    #[test]
    fn test_linear_backoff() {
        let config = RetryConfig {
            retry_delay: 3,
            exponential_backoff: false,
            max_delay: 10,
        };
        assert_eq!(config.delay_for(4), Duration::from_secs(3));
    }

    #[test]
    fn test_retry_ceiling() {
        let mut msg = message();
        assert!(msg.can_retry());
        msg.mark_retry("boom", Utc::now());
        msg.mark_retry("boom", Utc::now());
        assert_eq!(msg.retried, 2);
        assert_eq!(msg.state, TaskState::Retry);
        assert!(!msg.can_retry());
    }

    #[test]
    fn test_sub_second_timeout_is_kept() {
        let task = Task::new("email:delivery", Vec::new());
        let msg = TaskMessage::new(&task, "default".to_string(), 0, Duration::from_millis(500));
        assert_eq!(msg.timeout_ms, 500);
        assert_eq!(msg.timeout(), Duration::from_millis(500));

        let msg = TaskMessage::new(&task, "default".to_string(), 0, Duration::from_micros(10));
        assert_eq!(msg.timeout(), Duration::from_millis(1));

        let msg = TaskMessage::new(&task, "default".to_string(), 0, Duration::ZERO);
        assert!(msg.timeout().is_zero());
    }

    #[test]
    fn test_readiness() {
        let mut msg = message();
        let now = Utc::now();
        assert!(msg.is_ready(now));
        msg.process_at = Some(now + chrono::Duration::seconds(5));
        assert!(!msg.is_ready(now));
        assert!(msg.is_ready(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_message_json_keeps_payload_bytes() {
        let msg = message();
        let json = serde_json::to_string(&msg).unwrap();
        let back: TaskMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.info().queue, "default");
    }
}
