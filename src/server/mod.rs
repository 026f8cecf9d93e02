pub mod health;
pub mod routes;
pub mod sse;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tokio_util::sync::CancellationToken;

use crate::models::ServerConfig;
use crate::service::Dispatcher;

/// Shared application state for the Axum server.
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
    /// Cancelled at shutdown; every long-lived stream runs under a child.
    pub shutdown: CancellationToken,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", get(routes::list_jobs).post(routes::queue_job))
        .route("/api/jobs/validate", post(routes::validate_job))
        .route("/api/jobs/prune", post(routes::prune_jobs))
        .route("/api/jobs/{id}", get(routes::get_job))
        .route("/api/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/api/jobs/{id}/stream", get(sse::job_stream_handler))
        .route("/api/runners", get(routes::list_runners))
        .route("/api/runners/config/ws", get(ws::runner_config_ws))
        .route("/api/runners/jobs/ws", get(ws::runner_jobs_ws))
        .route("/api/runners/{id}", get(routes::get_runner))
        .route(
            "/api/config",
            get(routes::get_config).put(routes::set_config),
        )
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}
