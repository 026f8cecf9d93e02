use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::jobs::{JobStore, JobStoreConfig};
use crate::models::{Job, ServerConfig};
use crate::registry::{ConfigStore, RunnerRegistry};
use crate::server::{self, AppState};
use crate::service::Dispatcher;
use crate::storage::{InMemoryRepository, JobRepository, JsonRepository};

const APP_DIR: &str = "job-dispatcher";
const JOBS_FILE: &str = "jobs.json";

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load the ServerConfig, first match wins:
///   1. `--config` CLI flag (passed as config_path)
///   2. `JOBD_CONFIG_DIR` environment variable
///   3. Platform config dir (`dirs::config_dir()/job-dispatcher/config.json`)
///   4. `{data_dir}/config.json`
///   5. `ServerConfig::default()`
pub fn load_config(config_path: Option<&Path>) -> Result<ServerConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("JOBD_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path);
    }

    tracing::info!("No config file found, using defaults");
    Ok(ServerConfig::default())
}

fn read_config(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ServerConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Resolve the data directory: the override, then `JOBD_DATA_DIR`, then
/// the platform data dir (`~/.local/share/job-dispatcher` on Linux).
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("JOBD_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Open the job repository and recover the job table.
///
/// With `config.data_dir` unset the server keeps jobs in memory only.
pub async fn build_state(config: ServerConfig) -> Result<Arc<AppState>> {
    let repo: Arc<JobRepository> = match &config.data_dir {
        Some(dir) => {
            let repo = JsonRepository::<Job>::open(dir, JOBS_FILE).await?;
            tracing::info!("Job repository: {}", repo.path().display());
            Arc::new(repo)
        }
        None => {
            tracing::info!("Running with an in-memory job repository");
            Arc::new(InMemoryRepository::<Job>::new())
        }
    };

    let runners = Arc::new(RunnerRegistry::new());
    let jobs = JobStore::open(repo, runners.clone(), JobStoreConfig::from(&config))
        .await
        .context("Failed to recover job table")?;

    Ok(Arc::new(AppState {
        dispatcher: Dispatcher::new(jobs, runners, Arc::new(ConfigStore::new())),
        config: Arc::new(config),
        start_time: Instant::now(),
        shutdown: CancellationToken::new(),
    }))
}

/// Periodically drop the oldest terminal jobs beyond `max`.
pub async fn run_prune_loop(
    dispatcher: Dispatcher,
    interval: Duration,
    max: usize,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match dispatcher.prune_old_jobs(max).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Pruned {} old jobs", n),
                Err(e) => tracing::warn!("Failed to prune old jobs: {}", e),
            },
        }
    }
}

/// Serve the API on `listener` until `state.shutdown` is cancelled, then
/// stop all job timers.
pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let token = state.shutdown.clone();

    let prune_handle = tokio::spawn(run_prune_loop(
        state.dispatcher.clone(),
        Duration::from_secs(state.config.prune_interval_secs.max(1)),
        state.config.prune_max_jobs,
        token.clone(),
    ));

    let router = server::create_router(Arc::clone(&state));
    let server_token = token.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            server_token.cancelled().await;
            tracing::info!("HTTP server received shutdown signal");
        })
        .await
        .context("HTTP server failed");

    token.cancel();
    let _ = prune_handle.await;
    state.dispatcher.jobs().shutdown().await;
    result
}

/// Start the dispatcher server and run until Ctrl+C or SIGTERM.
pub async fn start_server(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
    ephemeral: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    config.data_dir = if ephemeral {
        None
    } else if let Some(d) = data_dir_override {
        Some(d.to_path_buf())
    } else if let Some(d) = config.data_dir.take() {
        Some(d)
    } else {
        Some(resolve_data_dir(None))
    };

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .context(format!("Failed to bind to {}", bind_addr))?;
    tracing::info!("Dispatcher started. Listening on http://{}", bind_addr);

    let token = state.shutdown.clone();
    let server = tokio::spawn(serve(state, listener));

    wait_for_signal(&token).await?;
    token.cancel();

    server.await.context("Server task panicked")??;
    tracing::info!("Dispatcher exited cleanly.");
    Ok(())
}

async fn wait_for_signal(token: &CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
            _ = token.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = token.cancelled() => {}
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewJob, Operation, ResourceRef, Scope, TargetRunner};
    use crate::service::QueueJobRequest;
    use tempfile::TempDir;

    fn queue_request() -> QueueJobRequest {
        QueueJobRequest {
            job: Some(NewJob {
                scope: Some(Scope::Project(ResourceRef::new("p1"))),
                target_runner: Some(TargetRunner::Any),
                operation: Some(Operation {
                    kind: "up".to_string(),
                    exclusive: false,
                    payload: serde_json::Value::Null,
                }),
                ..Default::default()
            }),
            expires_in: None,
        }
    }

    // =======================================================================
    // 1. Config loading
    // =======================================================================
    #[test]
    fn test_config_loading_returns_defaults_when_no_file() {
        let config = load_config(None).expect("load config");
        assert_eq!(config.prune_max_jobs, ServerConfig::default().prune_max_jobs);
    }

    #[test]
    fn test_config_loading_from_file() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let config_path = tmp_dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"port": 9999, "host": "0.0.0.0"}"#).expect("write config");

        let config = load_config(Some(&config_path)).expect("load config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9999);
        // Other fields should be defaults
        assert_eq!(config.ack_timeout_secs, 120);
    }

    #[test]
    fn test_config_loading_nonexistent_explicit_path_fails() {
        let result = load_config(Some(Path::new("/nonexistent/config.json")));
        assert!(result.is_err(), "Should fail for nonexistent explicit path");
    }

    #[test]
    fn test_config_loading_invalid_json_fails() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let config_path = tmp_dir.path().join("config.json");
        std::fs::write(&config_path, "{not json").expect("write config");

        let err = load_config(Some(&config_path)).expect_err("should fail");
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    // =======================================================================
    // 2. Data directory
    // =======================================================================
    #[test]
    fn test_resolve_data_dir_with_override() {
        let path = PathBuf::from("/custom/data");
        let resolved = resolve_data_dir(Some(&path));
        assert_eq!(resolved, path);
    }

    #[test]
    fn test_resolve_data_dir_default_not_empty() {
        let resolved = resolve_data_dir(None);
        assert!(!resolved.to_string_lossy().is_empty());
        if std::env::var("JOBD_DATA_DIR").is_err() {
            assert!(
                resolved.to_string_lossy().contains("job-dispatcher"),
                "Default data dir should contain 'job-dispatcher', got: {}",
                resolved.display()
            );
        }
    }

    // =======================================================================
    // 3. State bootstrap
    // =======================================================================
    #[tokio::test]
    async fn test_build_state_persists_jobs_across_restarts() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let config = ServerConfig {
            data_dir: Some(tmp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let state = build_state(config.clone()).await.expect("build state");
        let job = state
            .dispatcher
            .queue_job(queue_request())
            .await
            .expect("queue job");
        state.dispatcher.jobs().shutdown().await;
        drop(state);

        assert!(tmp_dir.path().join(JOBS_FILE).exists());

        let state = build_state(config).await.expect("rebuild state");
        let view = state.dispatcher.get_job(job.id).await.expect("get job");
        assert_eq!(view.job.id, job.id);
        assert_eq!(view.job.operation.kind, "up");
    }

    #[tokio::test]
    async fn test_build_state_without_data_dir_is_ephemeral() {
        let state = build_state(ServerConfig::default()).await.expect("build state");
        state
            .dispatcher
            .queue_job(queue_request())
            .await
            .expect("queue job");
        assert_eq!(state.dispatcher.list_jobs().await.len(), 1);
    }

    // =======================================================================
    // 4. Serve and shutdown
    // =======================================================================
    #[tokio::test]
    async fn test_serve_stops_on_shutdown_token() {
        let state = build_state(ServerConfig::default()).await.expect("build state");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let token = state.shutdown.clone();
        let handle = tokio::spawn(serve(state, listener));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("serve should stop")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_prune_loop_removes_terminal_jobs() {
        let state = build_state(ServerConfig::default()).await.expect("build state");
        for _ in 0..3 {
            let job = state
                .dispatcher
                .queue_job(queue_request())
                .await
                .expect("queue job");
            state.dispatcher.cancel_job(job.id).await.expect("cancel");
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_prune_loop(
            state.dispatcher.clone(),
            Duration::from_millis(20),
            1,
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.expect("join");

        assert_eq!(state.dispatcher.list_jobs().await.len(), 1);
    }
}
