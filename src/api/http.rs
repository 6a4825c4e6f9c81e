use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use super::{GoalStateApi, JobStatus, JobSummary};
use crate::error::JobMgrError;
use crate::job::{GoalState, JobSpec};

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
pub struct WaitRequest {
    pub goal_state: GoalState,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
struct GoalResponse {
    job_id: Uuid,
    goal_state: GoalState,
}

/// Error body and status code for a failed request.
pub struct ApiError(JobMgrError);

impl From<JobMgrError> for ApiError {
    fn from(err: JobMgrError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            JobMgrError::Validation(_) => StatusCode::BAD_REQUEST,
            JobMgrError::JobNotFound(_) | JobMgrError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            JobMgrError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            JobMgrError::JobNotTerminal(_) | JobMgrError::Conflict { .. } => StatusCode::CONFLICT,
            JobMgrError::Master(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Routes of the goal-state API.
pub fn router(api: GoalStateApi) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(create_job_handler))
        .route(
            "/api/jobs/:id",
            get(get_job_handler).delete(delete_job_handler),
        )
        .route("/api/jobs/:id/stop", post(stop_job_handler))
        .route("/api/jobs/:id/start", post(start_job_handler))
        .route("/api/jobs/:id/wait", post(wait_job_handler))
        .layer(cors)
        .with_state(api)
}

/// Serve the API on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    api: GoalStateApi,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP API");

    axum::serve(listener, router(api))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("HTTP API stopped");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_jobs_handler(State(api): State<GoalStateApi>) -> ApiResult<Json<Vec<JobSummary>>> {
    Ok(Json(api.list_jobs()?))
}

async fn create_job_handler(
    State(api): State<GoalStateApi>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<impl IntoResponse> {
    let job_id = api.create(spec)?;
    Ok((StatusCode::CREATED, Json(CreateJobResponse { job_id })))
}

async fn get_job_handler(
    State(api): State<GoalStateApi>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatus>> {
    Ok(Json(api.get_job(job_id)?))
}

async fn delete_job_handler(
    State(api): State<GoalStateApi>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    api.delete_job(job_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_job_handler(
    State(api): State<GoalStateApi>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<GoalResponse>> {
    api.stop(job_id)?;
    Ok(Json(GoalResponse {
        job_id,
        goal_state: GoalState::Killed,
    }))
}

async fn start_job_handler(
    State(api): State<GoalStateApi>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<GoalResponse>> {
    api.start(job_id)?;
    Ok(Json(GoalResponse {
        job_id,
        goal_state: GoalState::Running,
    }))
}

async fn wait_job_handler(
    State(api): State<GoalStateApi>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<WaitRequest>,
) -> ApiResult<Json<JobStatus>> {
    let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
    let status = api
        .wait_for_state(job_id, request.goal_state, timeout)
        .await?;
    Ok(Json(status))
}
