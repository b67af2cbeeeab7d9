//! Worker pool that pulls tasks from the broker and runs their handlers

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::handler::{HandlerError, HandlerRegistry, HandlerResult, TaskContext};
use crate::task::{RetryConfig, TaskMessage};

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier
    pub worker_id: WorkerId,
    /// Queues this worker will process, in the order they are tried
    pub queues: Vec<String>,
    /// Maximum number of tasks running at once
    pub concurrency: usize,
    /// Idle time between polls when no task is eligible, in milliseconds
    pub polling_interval_ms: u64,
    /// Interval for moving due scheduled/retry tasks to pending, in milliseconds
    pub forward_interval_ms: u64,
    /// How long shutdown waits for in-flight tasks before cancelling them, in milliseconds
    pub shutdown_grace_period_ms: u64,
    /// Backoff for retryable failures
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            queues: vec!["default".to_string()],
            concurrency: 10,
            polling_interval_ms: 1000,
            forward_interval_ms: 1000,
            shutdown_grace_period_ms: 8000,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> TaskResult<()> {
        if self.concurrency == 0 {
            return Err(TaskError::config("worker concurrency must be at least 1"));
        }
        if self.queues.is_empty() {
            return Err(TaskError::config("worker needs at least one queue"));
        }
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(TaskError::config("queue names cannot be empty"));
        }
        Ok(())
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_requeued: u64,
    pub average_execution_time_ms: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Everything one slot needs to run a task and report the result
#[derive(Clone)]
struct Dispatch {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    stats: Arc<Mutex<WorkerStats>>,
    retry: RetryConfig,
    /// Fired when the shutdown grace period runs out
    abort: CancellationToken,
}

/// Worker pool with a fixed number of execution slots
pub struct Worker {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    stats: Arc<Mutex<WorkerStats>>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a worker. `shutdown` is the signal that stops it; the registry
    /// is frozen from here on.
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = WorkerStats {
            started_at: chrono::Utc::now(),
            ..WorkerStats::default()
        };

        Self {
            slots: Arc::new(Semaphore::new(config.concurrency)),
            config,
            broker,
            registry: Arc::new(registry),
            stats: Arc::new(Mutex::new(stats)),
            shutdown,
        }
    }

    /// Run until the shutdown token fires, then drain in-flight tasks.
    ///
    /// Broker resources stay open; the owner closes the broker after this returns.
    pub async fn run(&self) -> TaskResult<()> {
        self.config.validate()?;

        info!(
            "Starting worker {} for queues {:?} (concurrency: {})",
            self.config.worker_id, self.config.queues, self.config.concurrency
        );
        info!("Registered task types: {:?}", self.registry.task_types());

        let forwarder = self.start_forwarder();
        let abort = CancellationToken::new();
        let dispatch = Dispatch {
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            retry: self.config.retry.clone(),
            abort: abort.clone(),
        };
        let poll = Duration::from_millis(self.config.polling_interval_ms);

        loop {
            // Wait for a free slot before pulling, so the broker keeps what we cannot run
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => permit
                    .map_err(|e| TaskError::worker(format!("slot semaphore closed: {}", e)))?,
            };

            match self.broker.dequeue(&self.config.queues).await {
                Ok(Some(msg)) => {
                    debug!("Got task {} from queue {}", msg.id, msg.queue);
                    tokio::spawn(Self::execute(dispatch.clone(), msg, permit));
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(poll) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to dequeue: {}", e);
                    tokio::select! {
                        _ = sleep(poll) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Worker {} stopped pulling tasks", self.config.worker_id);
        if let Err(e) = forwarder.await {
            warn!("Forwarder ended abnormally: {}", e);
        }

        self.drain(&abort).await;
        info!("Worker {} shut down complete", self.config.worker_id);
        Ok(())
    }

    /// Wait for every slot to come back, cancelling handlers once the grace period is over
    async fn drain(&self, abort: &CancellationToken) {
        let all_slots = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let in_flight = self.active_tasks();
        if in_flight > 0 {
            info!("Waiting for {} active tasks to complete", in_flight);
        }

        let grace = Duration::from_millis(self.config.shutdown_grace_period_ms);
        if timeout(grace, self.slots.acquire_many(all_slots)).await.is_err() {
            warn!(
                "Grace period elapsed with {} active tasks, cancelling them",
                self.active_tasks()
            );
            abort.cancel();
            if self.slots.acquire_many(all_slots).await.is_err() {
                error!("Slot semaphore closed while draining");
            }
        }
    }

    /// Periodically move due scheduled and retry tasks to pending
    fn start_forwarder(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.broker.clone();
        let queues = self.config.queues.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_millis(self.config.forward_interval_ms);

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                if let Err(e) = broker.forward_ready(&queues).await {
                    error!("Failed to forward scheduled tasks: {}", e);
                }
            }

            debug!("Forwarder stopped");
        })
    }

    /// Run one task in its slot and report the outcome to the broker
    async fn execute(dispatch: Dispatch, mut msg: TaskMessage, _permit: OwnedSemaphorePermit) {
        let start_time = std::time::Instant::now();

        let handler = match dispatch.registry.resolve(&msg.type_name) {
            Ok(handler) => handler,
            Err(e) => {
                error!("Task {} is unroutable: {}", msg.id, e);
                Self::record_duration(&dispatch, start_time.elapsed()).await;
                Self::archive(&dispatch, &mut msg, &e.to_string()).await;
                return;
            }
        };

        let task_timeout = msg.timeout();
        let deadline = if task_timeout.is_zero() {
            None
        } else {
            chrono::Duration::from_std(task_timeout)
                .ok()
                .map(|t| Utc::now() + t)
        };
        let cancel = dispatch.abort.child_token();
        let ctx = TaskContext::new(&msg, deadline, cancel.clone());
        let payload = msg.payload.clone();

        // The handler runs in its own task so a panic stays inside this slot
        let mut invocation = tokio::spawn(async move { handler.handle(ctx, &payload).await });

        let result = if task_timeout.is_zero() {
            Self::join_result(invocation.await)
        } else {
            match timeout(task_timeout, &mut invocation).await {
                Ok(joined) => Self::join_result(joined),
                Err(_) => {
                    cancel.cancel();
                    invocation.abort();
                    Err(HandlerError::retryable(format!(
                        "task timed out after {:?}",
                        task_timeout
                    )))
                }
            }
        };

        let execution_duration = start_time.elapsed();
        Self::record_duration(&dispatch, execution_duration).await;

        match result {
            Ok(()) => {
                msg.mark_completed();
                dispatch.stats.lock().await.tasks_successful += 1;
                if let Err(e) = dispatch.broker.done(&msg).await {
                    error!("Failed to mark task {} as completed: {}", msg.id, e);
                }
                info!("Task {} completed successfully in {:?}", msg.id, execution_duration);
            }
            Err(HandlerError::Permanent(detail)) => {
                error!("Task {} failed permanently: {}", msg.id, detail);
                Self::archive(&dispatch, &mut msg, &detail).await;
            }
            Err(HandlerError::Retryable(detail)) if dispatch.abort.is_cancelled() => {
                // Interrupted by shutdown, not by its own fault: no retry is consumed
                warn!("Task {} interrupted by shutdown: {}", msg.id, detail);
                dispatch.stats.lock().await.tasks_requeued += 1;
                if let Err(e) = dispatch.broker.requeue(&msg).await {
                    error!("Failed to requeue task {}: {}", msg.id, e);
                }
            }
            Err(HandlerError::Retryable(detail)) => {
                if msg.can_retry() {
                    let delay = dispatch.retry.delay_for(msg.retried + 1);
                    let backoff = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    let retry_at = Utc::now() + backoff;
                    msg.mark_retry(&detail, retry_at);
                    warn!(
                        "Task {} failed: {} (retry {}/{} in {:?})",
                        msg.id, detail, msg.retried, msg.max_retry, delay
                    );
                    dispatch.stats.lock().await.tasks_retried += 1;
                    if let Err(e) = dispatch.broker.retry(&msg).await {
                        error!("Failed to schedule retry for task {}: {}", msg.id, e);
                    }
                } else {
                    let detail = format!("retry limit {} exhausted: {}", msg.max_retry, detail);
                    error!("Task {} failed: {}", msg.id, detail);
                    Self::archive(&dispatch, &mut msg, &detail).await;
                }
            }
        }
    }

    fn join_result(joined: Result<HandlerResult, JoinError>) -> HandlerResult {
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::retryable("handler panicked")),
            Err(_) => Err(HandlerError::retryable("handler was cancelled")),
        }
    }

    async fn archive(dispatch: &Dispatch, msg: &mut TaskMessage, detail: &str) {
        msg.mark_archived(detail);
        dispatch.stats.lock().await.tasks_failed += 1;
        if let Err(e) = dispatch.broker.archive(msg).await {
            error!("Failed to archive task {}: {}", msg.id, e);
        }
    }

    async fn record_duration(dispatch: &Dispatch, execution_duration: Duration) {
        let mut stats = dispatch.stats.lock().await;
        stats.tasks_processed += 1;

        let new_avg = if stats.tasks_processed == 1 {
            execution_duration.as_millis() as f64
        } else {
            (stats.average_execution_time_ms * (stats.tasks_processed - 1) as f64
                + execution_duration.as_millis() as f64)
                / stats.tasks_processed as f64
        };
        stats.average_execution_time_ms = new_avg;
    }

    /// Number of slots currently running a task
    pub fn active_tasks(&self) -> usize {
        self.config
            .concurrency
            .saturating_sub(self.slots.available_permits())
    }

    /// Get worker statistics
    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Signal the worker to stop pulling and drain
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}
