//! # Task Dispatch
//!
//! Background job dispatch over Redis: producers enqueue typed tasks, a worker
//! pool pulls them and runs the handler registered for each task type.
//!
//! ## Features
//!
//! - Typed tasks with opaque payloads
//! - Immediate or delayed eligibility
//! - Bounded worker concurrency with graceful drain
//! - Retryable vs permanent (skip-retry) failures with backoff
//! - HTTP producer API
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskdispatch::broker::{BrokerConfig, RedisBroker};
//! use taskdispatch::tasks::{new_email_delivery_task, register_handlers};
//! use taskdispatch::{HandlerRegistry, TaskClient, Worker, WorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> taskdispatch::TaskResult<()> {
//! let broker = Arc::new(RedisBroker::new(BrokerConfig::from_addr("localhost:6379")).await?);
//!
//! let client = TaskClient::new(broker.clone());
//! let task = new_email_delivery_task("a@b.com", "hi", "there")?;
//! let info = client.enqueue(&task, &[]).await?;
//! println!("enqueued {} on {}", info.id, info.queue);
//!
//! let mut registry = HandlerRegistry::new();
//! register_handlers(&mut registry);
//! let worker = Worker::new(WorkerConfig::default(), broker, registry, CancellationToken::new());
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod task;
pub mod tasks;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use client::{EnqueueOption, TaskClient};
pub use config::AppConfig;
pub use error::{TaskError, TaskResult};
pub use handler::{Handler, HandlerError, HandlerRegistry, HandlerResult, TaskContext};
pub use task::{Task, TaskId, TaskInfo, TaskMessage, TaskState};
pub use worker::{Worker, WorkerConfig};

/// Version of the task dispatch library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
