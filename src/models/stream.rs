// Messages exchanged on the runner and observer streams.

use serde::{Deserialize, Serialize};

use super::job::{Job, JobState};
use super::runner::{ConfigVar, Runner};
use super::terminal::TerminalEvent;
use crate::errors::Status;

/// Runner -> server on the job stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunnerJobStreamRequest {
    Request {
        runner_id: String,
    },
    Ack,
    Error {
        error: Status,
    },
    Heartbeat,
    Terminal {
        events: Vec<TerminalEvent>,
    },
    Complete {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
}

impl RunnerJobStreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerJobStreamRequest::Request { .. } => "request",
            RunnerJobStreamRequest::Ack => "ack",
            RunnerJobStreamRequest::Error { .. } => "error",
            RunnerJobStreamRequest::Heartbeat => "heartbeat",
            RunnerJobStreamRequest::Terminal { .. } => "terminal",
            RunnerJobStreamRequest::Complete { .. } => "complete",
        }
    }
}

/// Server -> runner on the job stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunnerJobStreamResponse {
    Assignment { job: Box<Job> },
    Cancel { force: bool },
}

/// Server -> observer on GetJobStream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GetJobStreamResponse {
    Open,
    State {
        previous: JobState,
        current: JobState,
        job: Box<Job>,
        canceling: bool,
    },
    Terminal {
        events: Vec<TerminalEvent>,
        buffered: bool,
    },
    Complete {
        error: Option<Status>,
        result: Option<serde_json::Value>,
    },
}

impl GetJobStreamResponse {
    /// SSE event name for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            GetJobStreamResponse::Open => "open",
            GetJobStreamResponse::State { .. } => "state",
            GetJobStreamResponse::Terminal { .. } => "terminal",
            GetJobStreamResponse::Complete { .. } => "complete",
        }
    }
}

/// Runner -> server on the config stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunnerConfigRequest {
    Open { runner: Runner },
}

/// Server -> runner on the config stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunnerConfigResponse {
    Config { config_vars: Vec<ConfigVar> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_request_variants_serialize_without_data() {
        let json = serde_json::to_string(&RunnerJobStreamRequest::Ack).expect("serialize");
        assert_eq!(json, r#"{"type":"ack"}"#);
        let back: RunnerJobStreamRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, RunnerJobStreamRequest::Ack);
    }

    #[test]
    fn test_request_with_runner_id() {
        let json = r#"{"type":"request","data":{"runner_id":"r1"}}"#;
        let req: RunnerJobStreamRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(
            req,
            RunnerJobStreamRequest::Request {
                runner_id: "r1".to_string()
            }
        );
        assert_eq!(req.kind(), "request");
    }

    #[test]
    fn test_complete_without_result() {
        let json = r#"{"type":"complete","data":{}}"#;
        let req: RunnerJobStreamRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(req, RunnerJobStreamRequest::Complete { result: None });
    }

    #[test]
    fn test_cancel_response_serializes() {
        let json =
            serde_json::to_string(&RunnerJobStreamResponse::Cancel { force: true }).expect("ser");
        assert_eq!(json, r#"{"type":"cancel","data":{"force":true}}"#);
    }

    #[test]
    fn test_observer_event_kinds() {
        assert_eq!(GetJobStreamResponse::Open.kind(), "open");
        let complete = GetJobStreamResponse::Complete {
            error: Some(Status::canceled()),
            result: None,
        };
        assert_eq!(complete.kind(), "complete");
        let json = serde_json::to_value(&complete).expect("serialize");
        assert_eq!(json["data"]["error"]["code"], "canceled");
    }

    #[test]
    fn test_config_open_parses() {
        let json = r#"{"type":"open","data":{"runner":{"id":"r9","by_id_only":true}}}"#;
        let RunnerConfigRequest::Open { runner } =
            serde_json::from_str(json).expect("deserialize");
        assert_eq!(runner.id, "r9");
        assert!(runner.by_id_only);
    }
}
