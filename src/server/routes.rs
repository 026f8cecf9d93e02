use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::errors::{Code, DispatchError};
use crate::models::{ConfigVar, Job, NewJob, Runner};
use crate::service::{JobView, QueueJobRequest, QueueJobResponse, ValidateJobResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// A [`DispatchError`] rendered as an HTTP error.
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

pub fn status_for(code: Code) -> StatusCode {
    match code {
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted | Code::Canceled => StatusCode::CONFLICT,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        if code == Code::Internal {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: code.as_str().to_string(),
            message: self.0.message().to_string(),
        };
        (status_for(code), Json(body)).into_response()
    }
}

pub(crate) fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(DispatchError::NotFound(format!("job '{}' not found", raw))))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.dispatcher.list_jobs().await)
}

pub async fn queue_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueueJobRequest>,
) -> Result<(StatusCode, Json<QueueJobResponse>), ApiError> {
    let job = state.dispatcher.queue_job(req).await?;
    Ok((StatusCode::CREATED, Json(QueueJobResponse { job_id: job.id })))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.dispatcher.get_job(id).await?))
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = parse_job_id(&id)?;
    state.dispatcher.cancel_job(id).await?;
    Ok(Json(state.dispatcher.get_job(id).await?))
}

pub async fn validate_job(
    State(state): State<Arc<AppState>>,
    Json(job): Json<NewJob>,
) -> Json<ValidateJobResponse> {
    Json(state.dispatcher.validate_job(&job))
}

#[derive(Debug, Deserialize, Default)]
pub struct PruneParams {
    pub max: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PruneResponse {
    pub pruned: usize,
}

pub async fn prune_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PruneParams>,
) -> Result<Json<PruneResponse>, ApiError> {
    let max = params.max.unwrap_or(state.config.prune_max_jobs);
    let pruned = state.dispatcher.prune_old_jobs(max).await?;
    Ok(Json(PruneResponse { pruned }))
}

// ---------------------------------------------------------------------------
// Runners and config
// ---------------------------------------------------------------------------

pub async fn list_runners(State(state): State<Arc<AppState>>) -> Json<Vec<Runner>> {
    Json(state.dispatcher.list_runners())
}

pub async fn get_runner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Runner>, ApiError> {
    Ok(Json(state.dispatcher.get_runner(&id)?))
}

#[derive(Debug, Deserialize, Default)]
pub struct ConfigParams {
    pub runner_id: Option<String>,
}

/// All vars, or only those a runner with `runner_id` would receive.
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConfigParams>,
) -> Json<Vec<ConfigVar>> {
    let vars = match params.runner_id {
        Some(id) => state.dispatcher.config_vars().for_runner(&Runner::new(id)),
        None => state.dispatcher.config_vars().list(),
    };
    Json(vars)
}

pub async fn set_config(
    State(state): State<Arc<AppState>>,
    Json(vars): Json<Vec<ConfigVar>>,
) -> StatusCode {
    tracing::info!("Updating {} config vars", vars.len());
    state.dispatcher.set_config(vars);
    StatusCode::NO_CONTENT
}
