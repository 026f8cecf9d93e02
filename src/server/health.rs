use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub active_jobs: usize,
    pub total_jobs: usize,
    pub runners: usize,
    pub version: String,
    pub data_dir: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let jobs = state.dispatcher.list_jobs().await;
    let active_jobs = jobs.iter().filter(|j| !j.state.is_terminal()).count();

    let data_dir = state
        .config
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "ephemeral".to_string());

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_jobs,
        total_jobs: jobs.len(),
        runners: state.dispatcher.list_runners().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir,
    };

    (StatusCode::OK, Json(response))
}
