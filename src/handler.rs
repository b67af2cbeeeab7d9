//! Handler contract and the registry the worker routes tasks through

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskMessage};

/// How a handler invocation failed.
///
/// The worker pattern-matches on the variant: `Retryable` goes back to the
/// broker for another attempt, `Permanent` is archived and never dispatched again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0} (skip retry)")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable<S: Into<String>>(detail: S) -> Self {
        Self::Retryable(detail.into())
    }

    pub fn permanent<S: Into<String>>(detail: S) -> Self {
        Self::Permanent(detail.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

/// Outcome of one handler invocation
pub type HandlerResult = Result<(), HandlerError>;

/// Decode a JSON payload; an undecodable payload can never succeed, so it is permanent
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(payload)
        .map_err(|e| HandlerError::permanent(format!("json decode failed: {}", e)))
}

/// Execution context handed to each handler invocation
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub type_name: String,
    pub queue: String,
    pub retried: u32,
    pub max_retry: u32,
    /// Moment the runtime stops waiting for this invocation, if the task has a timeout
    pub deadline: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        msg: &TaskMessage,
        deadline: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: msg.id,
            type_name: msg.type_name.clone(),
            queue: msg.queue.clone(),
            retried: msg.retried,
            max_retry: msg.max_retry,
            deadline,
            cancel,
        }
    }

    /// Resolves once the runtime cancels this invocation (shutdown or timeout)
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Task-type-specific business logic
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> HandlerResult;
}

/// Adapter that lets a plain async closure act as a [`Handler`]
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> HandlerResult {
        (self.0)(ctx, payload.to_vec()).await
    }
}

/// Maps task types to handlers. Built at startup, read-only while dispatching.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. A second registration for the same
    /// type replaces the first.
    pub fn register<S, H>(&mut self, task_type: S, handler: H)
    where
        S: Into<String>,
        H: Handler + 'static,
    {
        let task_type = task_type.into();
        if self
            .handlers
            .insert(task_type.clone(), Arc::new(handler))
            .is_some()
        {
            warn!("Handler for task type {} replaced", task_type);
        } else {
            debug!("Registered handler for task type {}", task_type);
        }
    }

    /// Register an async closure as the handler for a task type
    pub fn register_fn<S, F, Fut>(&mut self, task_type: S, f: F)
    where
        S: Into<String>,
        F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(task_type, HandlerFn(f));
    }

    /// Find the handler for a task type
    pub fn resolve(&self, task_type: &str) -> TaskResult<Arc<dyn Handler>> {
        self.handlers
            .get(task_type)
            .cloned()
            .ok_or_else(|| TaskError::HandlerNotFound {
                task_type: task_type.to_string(),
            })
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::time::Duration;

    fn context() -> TaskContext {
        let task = Task::new("t", Vec::new());
        let msg = TaskMessage::new(&task, "default".to_string(), 3, Duration::from_secs(5));
        TaskContext::new(&msg, Some(Utc::now()), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_resolve_registered_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("ok", |_ctx, _payload| async { Ok(()) });

        assert!(registry.contains("ok"));
        let handler = registry.resolve("ok").unwrap();
        assert_eq!(handler.handle(context(), b"").await, Ok(()));
    }

    #[test]
    fn test_resolve_unknown_type() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("missing").err().unwrap();
        assert!(matches!(
            err,
            TaskError::HandlerNotFound { ref task_type } if task_type == "missing"
        ));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("t", |_ctx, _payload| async {
            Err(HandlerError::retryable("first"))
        });
        registry.register_fn("t", |_ctx, _payload| async {
            Err(HandlerError::permanent("second"))
        });

        assert_eq!(registry.task_types(), vec!["t".to_string()]);
        let result = registry.resolve("t").unwrap().handle(context(), b"").await;
        assert_eq!(result, Err(HandlerError::permanent("second")));
    }

    #[test]
    fn test_decode_failure_is_permanent() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Payload {
            to: String,
        }

        let err = decode_payload::<Payload>(b"not json").unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().ends_with("(skip retry)"));
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let token = CancellationToken::new();
        let task = Task::new("t", Vec::new());
        let msg = TaskMessage::new(&task, "q".to_string(), 0, Duration::from_secs(1));
        let ctx = TaskContext::new(&msg, Some(Utc::now()), token.child_token());

        assert!(!ctx.is_cancelled());
        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.queue, "q");
    }
}
