use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of runner output stored in a job's log buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TerminalEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEventKind {
    Line {
        msg: String,
        #[serde(default)]
        style: String,
    },
    Raw {
        data: String,
        #[serde(default)]
        stderr: bool,
    },
    Status {
        status: String,
        msg: String,
        #[serde(default)]
        step: bool,
    },
}

impl TerminalEvent {
    pub fn line(msg: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: TerminalEventKind::Line {
                msg: msg.into(),
                style: String::new(),
            },
        }
    }

    pub fn raw(data: impl Into<String>, stderr: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: TerminalEventKind::Raw {
                data: data.into(),
                stderr,
            },
        }
    }

    /// Human readable text, used by `jobd watch`.
    pub fn text(&self) -> &str {
        match &self.kind {
            TerminalEventKind::Line { msg, .. } => msg,
            TerminalEventKind::Raw { data, .. } => data,
            TerminalEventKind::Status { msg, .. } => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_event_flattens_kind() {
        let event = TerminalEvent::line("hello");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "line");
        assert_eq!(json["msg"], "hello");
        assert!(json["timestamp"].is_string());

        let back: TerminalEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
        assert_eq!(back.text(), "hello");
    }

    #[test]
    fn test_raw_event_defaults_stderr() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","type":"raw","data":"x"}"#;
        let event: TerminalEvent = serde_json::from_str(json).expect("deserialize");
        assert_eq!(
            event.kind,
            TerminalEventKind::Raw {
                data: "x".to_string(),
                stderr: false
            }
        );
    }
}
