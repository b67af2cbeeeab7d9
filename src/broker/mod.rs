//! Broker contract between producers and consumers
//!
//! A broker durably stores task messages between submission and execution.
//! [`RedisBroker`] is the production implementation; [`MemoryBroker`] keeps
//! the same bookkeeping in process and is used by tests and embedded setups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaskResult;
use crate::task::{TaskId, TaskMessage};

pub mod memory;
pub mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::{BrokerConfig, RedisBroker};

/// Per-queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub active: u64,
    pub scheduled: u64,
    pub retry: u64,
    pub archived: u64,
    pub completed: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Check that the broker is reachable
    async fn ping(&self) -> TaskResult<()>;

    /// Store a message and make it eligible for dequeue immediately
    async fn enqueue(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Store a message that becomes eligible at `msg.process_at`
    async fn schedule(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Lease the next pending message, trying `queues` in order.
    ///
    /// The move from pending to active is atomic, so a message is handed to
    /// at most one caller.
    async fn dequeue(&self, queues: &[String]) -> TaskResult<Option<TaskMessage>>;

    /// Record success and drop the message from the active set
    async fn done(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Park a failed message until `msg.process_at`, then it becomes pending again
    async fn retry(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Record a terminal failure; the message is never dispatched again
    async fn archive(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Return an interrupted message to the head of its pending list
    async fn requeue(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Move scheduled and retry messages whose time has come to pending.
    /// Returns how many were moved.
    async fn forward_ready(&self, queues: &[String]) -> TaskResult<u64>;

    async fn get_task(&self, id: TaskId) -> TaskResult<Option<TaskMessage>>;

    async fn queue_stats(&self, queue: &str) -> TaskResult<QueueStats>;

    /// Release broker resources
    async fn close(&self) -> TaskResult<()>;
}
