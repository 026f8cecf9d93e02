use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: usize,
    #[serde(default = "default_log_chunk_count")]
    pub log_chunk_count: usize,
    #[serde(default = "default_prune_max_jobs")]
    pub prune_max_jobs: usize,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_sse_keepalive_secs")]
    pub sse_keepalive_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9701
}

fn default_ack_timeout_secs() -> u64 {
    120
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

fn default_log_chunk_size() -> usize {
    164
}

fn default_log_chunk_count() -> usize {
    32
}

fn default_prune_max_jobs() -> usize {
    50
}

fn default_prune_interval_secs() -> u64 {
    300
}

fn default_sse_keepalive_secs() -> u64 {
    15
}

impl ServerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            ack_timeout_secs: default_ack_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            log_chunk_size: default_log_chunk_size(),
            log_chunk_count: default_log_chunk_count(),
            prune_max_jobs: default_prune_max_jobs(),
            prune_interval_secs: default_prune_interval_secs(),
            sse_keepalive_secs: default_sse_keepalive_secs(),
        }
    }
}
