//! HTTP front end that validates submissions and hands them to the enqueue client

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::{EnqueueOption, TaskClient};
use crate::error::{TaskError, TaskResult};
use crate::task::TaskId;
use crate::tasks::{new_data_process_task, new_email_delivery_task};

/// Work duration substituted when a data processing request has no (or zero) delay
pub const DEFAULT_PROCESS_DELAY_SECS: u64 = 2;

/// Eligibility delay applied to every data processing task, whatever its `delay` field says
pub const PROCESS_ELIGIBILITY_DELAY: Duration = Duration::from_secs(5);

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    client: TaskClient,
}

/// Build the producer API routes
pub fn router(client: TaskClient) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/tasks/health", get(health_check))
        .route("/api/tasks/email", post(submit_email_task))
        .route("/api/tasks/process", post(submit_data_process_task))
        .with_state(AppState { client })
}

/// Serve the producer API until `shutdown` fires
pub async fn serve(
    config: &ServerConfig,
    client: TaskClient,
    shutdown: CancellationToken,
) -> TaskResult<()> {
    let listener = TcpListener::bind(config.addr.as_str()).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, router(client))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Error response body: `{"error": "..."}`
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation { message } => Self::bad_request(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// A required string field must be present and non-empty
fn required(value: Option<String>, field: &str) -> TaskResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TaskError::validation(format!("{} is required", field))),
    }
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: TaskId,
    queue: String,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    process_at: Option<String>,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

#[derive(Debug, Deserialize)]
struct EmailTaskRequest {
    to: Option<String>,
    subject: Option<String>,
    body: Option<String>,
}

async fn submit_email_task(
    State(state): State<AppState>,
    payload: Result<Json<EmailTaskRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(req) = payload?;
    let to = required(req.to, "to")?;
    let subject = required(req.subject, "subject")?;
    let body = required(req.body, "body")?;

    let task = new_email_delivery_task(&to, &subject, &body).map_err(|e| {
        error!("Failed to create email task: {}", e);
        ApiError::internal("Failed to create task")
    })?;

    let info = state.client.enqueue(&task, &[]).await.map_err(|e| {
        error!("Failed to enqueue email task: {}", e);
        ApiError::internal("Failed to enqueue task")
    })?;

    info!("Enqueued email task: ID={} Queue={}", info.id, info.queue);

    Ok(Json(SubmitResponse {
        task_id: info.id,
        queue: info.queue,
        message: "Email task submitted successfully",
        process_at: None,
    }))
}

#[derive(Debug, Deserialize)]
struct DataProcessTaskRequest {
    data_id: Option<String>,
    action: Option<String>,
    delay: Option<i64>,
}

async fn submit_data_process_task(
    State(state): State<AppState>,
    payload: Result<Json<DataProcessTaskRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(req) = payload?;
    let data_id = required(req.data_id, "data_id")?;
    let action = required(req.action, "action")?;
    let delay = match req.delay {
        None | Some(0) => DEFAULT_PROCESS_DELAY_SECS,
        Some(d) if d < 0 => return Err(ApiError::bad_request("delay cannot be negative")),
        Some(d) => d as u64,
    };

    let task = new_data_process_task(&data_id, &action, delay).map_err(|e| {
        error!("Failed to create data process task: {}", e);
        ApiError::internal("Failed to create task")
    })?;

    // `delay` only sets how long the handler works; eligibility is always fixed
    let info = state
        .client
        .enqueue(&task, &[EnqueueOption::ProcessIn(PROCESS_ELIGIBILITY_DELAY)])
        .await
        .map_err(|e| {
            error!("Failed to enqueue data process task: {}", e);
            ApiError::internal("Failed to enqueue task")
        })?;

    info!("Enqueued data process task: ID={} Queue={}", info.id, info.queue);

    Ok(Json(SubmitResponse {
        task_id: info.id,
        queue: info.queue,
        message: "Data processing task submitted successfully",
        process_at: Some(format!("in {} seconds", PROCESS_ELIGIBILITY_DELAY.as_secs())),
    }))
}
