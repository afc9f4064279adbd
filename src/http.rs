//! HTTP surface: the `process-jobs` trigger plus job and submission creation.

use crate::errors::{EnqueueError, ProcessError};
use crate::llm::ChatModel;
use crate::payload::{JobPayload, PackagePrompt};
use crate::processor::{ProcessOutcome, Processor};
use crate::storage;
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

struct AppState<M> {
    processor: Arc<Processor<M>>,
}

impl<M> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
        }
    }
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct ProcessedResponse {
    success: bool,
    job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct CreateJobRequest {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize)]
struct CreateJobResponse {
    job_id: Uuid,
}

#[derive(Deserialize)]
struct SubmitPromptRequest {
    title: String,
    raw_prompt: String,
    #[serde(default)]
    problem: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    integrations: Vec<String>,
}

#[derive(Serialize)]
struct SubmitPromptResponse {
    submission_id: Uuid,
    job_id: Uuid,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Error returned by a handler, rendered as `{ "error": <message> }`.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            Self::Internal(error) => {
                tracing::error!(%error, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, error)
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl From<EnqueueError> for ApiError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::InvalidPayload(_) => Self::BadRequest(error.to_string()),
            EnqueueError::SerializationError(_) | EnqueueError::DatabaseError(_) => {
                Self::Internal(error.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<ProcessError> for ApiError {
    fn from(error: ProcessError) -> Self {
        Self::Internal(error.to_string())
    }
}

/// Builds the router for the job service.
///
/// Every route answers CORS preflight requests with an empty 200.
pub fn router<M: ChatModel>(processor: Arc<Processor<M>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/process-jobs", post(process_jobs_handler::<M>))
        .route("/functions/v1/process-jobs", post(process_jobs_handler::<M>))
        .route("/jobs", post(create_job_handler::<M>))
        .route("/submissions", post(submit_prompt_handler::<M>))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { processor })
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Starting HTTP server");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn process_jobs_handler<M: ChatModel>(
    State(state): State<AppState<M>>,
) -> Result<Response, ApiError> {
    let response = match state.processor.process_next_job().await? {
        ProcessOutcome::NoJobs => Json(MessageResponse {
            message: "No jobs in queue",
        })
        .into_response(),
        ProcessOutcome::AlreadyClaimed { .. } => Json(MessageResponse {
            message: "Job already claimed",
        })
        .into_response(),
        ProcessOutcome::Completed { job_id, .. } => Json(ProcessedResponse {
            success: true,
            job_id,
            error: None,
        })
        .into_response(),
        ProcessOutcome::Failed { job_id, reason } => Json(ProcessedResponse {
            success: false,
            job_id,
            error: Some(reason),
        })
        .into_response(),
    };
    Ok(response)
}

async fn create_job_handler<M: ChatModel>(
    State(state): State<AppState<M>>,
    request: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let Json(request) = request?;
    let payload = JobPayload::decode(&request.job_type, &request.payload)
        .map_err(EnqueueError::from)?;
    let job_id = storage::enqueue_job(state.processor.pool(), &payload).await?;
    Ok(Json(CreateJobResponse { job_id }))
}

async fn submit_prompt_handler<M: ChatModel>(
    State(state): State<AppState<M>>,
    request: Result<Json<SubmitPromptRequest>, JsonRejection>,
) -> Result<Json<SubmitPromptResponse>, ApiError> {
    let Json(request) = request?;
    if request.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    if request.raw_prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("raw_prompt must not be empty".into()));
    }

    let (submission_id, job_id) = storage::submit_prompt(
        state.processor.pool(),
        PackagePrompt {
            submission_id: None,
            title: request.title,
            raw_prompt: request.raw_prompt,
            problem: request.problem,
            scope: request.scope,
            integrations: request.integrations,
        },
    )
    .await?;

    Ok(Json(SubmitPromptResponse {
        submission_id,
        job_id,
    }))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
