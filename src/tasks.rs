//! Reference task kinds: email delivery and data processing
//!
//! Each kind has a payload struct, a factory that encodes it into a [`Task`],
//! and a [`Handler`] that decodes it on the consumer side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::TaskResult;
use crate::handler::{
    decode_payload, Handler, HandlerError, HandlerRegistry, HandlerResult, TaskContext,
};
use crate::task::Task;

pub const TYPE_EMAIL_DELIVERY: &str = "email:delivery";
pub const TYPE_DATA_PROCESS: &str = "data:process";

/// Payload of an email delivery task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Payload of a data processing task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProcessPayload {
    pub data_id: String,
    pub action: String,
    /// Seconds of simulated work
    pub delay: u64,
}

/// Build an email delivery task. Inputs are encoded as given.
pub fn new_email_delivery_task(to: &str, subject: &str, body: &str) -> TaskResult<Task> {
    let payload = serde_json::to_vec(&EmailPayload {
        to: to.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
    })?;
    Ok(Task::new(TYPE_EMAIL_DELIVERY, payload))
}

/// Build a data processing task. Inputs are encoded as given.
pub fn new_data_process_task(data_id: &str, action: &str, delay: u64) -> TaskResult<Task> {
    let payload = serde_json::to_vec(&DataProcessPayload {
        data_id: data_id.to_string(),
        action: action.to_string(),
        delay,
    })?;
    Ok(Task::new(TYPE_DATA_PROCESS, payload))
}

/// Simulated email delivery taking a fixed time
pub struct EmailDeliveryHandler {
    send_duration: Duration,
}

impl EmailDeliveryHandler {
    pub fn new(send_duration: Duration) -> Self {
        Self { send_duration }
    }
}

impl Default for EmailDeliveryHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Handler for EmailDeliveryHandler {
    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> HandlerResult {
        let p: EmailPayload = decode_payload(payload)?;

        info!("[Email Task] Sending email to: {}", p.to);
        info!("   Subject: {}", p.subject);
        info!("   Body: {}", p.body);

        tokio::select! {
            _ = tokio::time::sleep(self.send_duration) => {}
            _ = ctx.cancelled() => {
                return Err(HandlerError::retryable(format!("email to {} cancelled", p.to)));
            }
        }

        info!("[Email Task] Successfully sent email to: {}", p.to);
        Ok(())
    }
}

/// Simulated data processing whose duration is `delay` units
pub struct DataProcessHandler {
    unit: Duration,
}

impl DataProcessHandler {
    /// `unit` is the length of one second of simulated work
    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }
}

impl Default for DataProcessHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Handler for DataProcessHandler {
    async fn handle(&self, ctx: TaskContext, payload: &[u8]) -> HandlerResult {
        let p: DataProcessPayload = decode_payload(payload)?;

        info!("[Data Process Task] Processing data: {}", p.data_id);
        info!("   Action: {}", p.action);
        info!("   Simulating processing for {} seconds...", p.delay);

        let work = self.unit.saturating_mul(u32::try_from(p.delay).unwrap_or(u32::MAX));
        tokio::select! {
            _ = tokio::time::sleep(work) => {}
            _ = ctx.cancelled() => {
                return Err(HandlerError::retryable(format!(
                    "processing of {} cancelled",
                    p.data_id
                )));
            }
        }

        info!("[Data Process Task] Successfully processed data: {}", p.data_id);
        Ok(())
    }
}

/// Register the reference handlers with their default timings
pub fn register_handlers(registry: &mut HandlerRegistry) {
    registry.register(TYPE_EMAIL_DELIVERY, EmailDeliveryHandler::default());
    registry.register(TYPE_DATA_PROCESS, DataProcessHandler::default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskMessage;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn context_for(task: &Task, token: &CancellationToken) -> TaskContext {
        let msg = TaskMessage::new(task, "default".to_string(), 3, Duration::from_secs(60));
        TaskContext::new(&msg, Some(Utc::now()), token.child_token())
    }

    #[test]
    fn test_email_payload_round_trip() {
        let task = new_email_delivery_task("a@b.com", "hi", "there").unwrap();
        assert_eq!(task.type_name(), TYPE_EMAIL_DELIVERY);

        let p: EmailPayload = decode_payload(task.payload()).unwrap();
        assert_eq!(p.to, "a@b.com");
        assert_eq!(p.subject, "hi");
        assert_eq!(p.body, "there");
        assert_eq!(serde_json::to_vec(&p).unwrap(), task.payload());
    }

    #[test]
    fn test_factory_takes_inputs_as_is() {
        let task = new_data_process_task("", "", 0).unwrap();
        let p: DataProcessPayload = decode_payload(task.payload()).unwrap();
        assert_eq!(p.data_id, "");
        assert_eq!(p.delay, 0);
    }

    #[tokio::test]
    async fn test_email_handler_succeeds() {
        let handler = EmailDeliveryHandler::new(Duration::from_millis(5));
        let task = new_email_delivery_task("a@b.com", "hi", "there").unwrap();
        let token = CancellationToken::new();

        let result = handler.handle(context_for(&task, &token), task.payload()).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let task = Task::new(TYPE_DATA_PROCESS, b"{\"data_id\": 7".to_vec());
        let token = CancellationToken::new();

        let result = DataProcessHandler::default()
            .handle(context_for(&task, &token), task.payload())
            .await;
        assert!(matches!(result, Err(HandlerError::Permanent(_))));

        let result = EmailDeliveryHandler::default()
            .handle(context_for(&task, &token), task.payload())
            .await;
        assert!(matches!(result, Err(HandlerError::Permanent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_handler_works_for_delay_units() {
        let handler = DataProcessHandler::new(Duration::from_secs(1));
        let task = new_data_process_task("d1", "transform", 3).unwrap();
        let token = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let result = handler.handle(context_for(&task, &token), task.payload()).await;
        assert_eq!(result, Ok(()));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_handlers_abort_on_cancellation() {
        let handler = DataProcessHandler::new(Duration::from_secs(60));
        let task = new_data_process_task("d1", "transform", 10).unwrap();
        let token = CancellationToken::new();
        let ctx = context_for(&task, &token);

        token.cancel();
        let result = handler.handle(ctx, task.payload()).await;
        assert!(matches!(result, Err(HandlerError::Retryable(_))));
    }

    #[test]
    fn test_register_handlers() {
        let mut registry = HandlerRegistry::new();
        register_handlers(&mut registry);
        assert_eq!(
            registry.task_types(),
            vec![TYPE_DATA_PROCESS.to_string(), TYPE_EMAIL_DELIVERY.to_string()]
        );
    }
}
