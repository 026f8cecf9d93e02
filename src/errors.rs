use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error class shared by the job store, the stream protocols and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    NotFound,
    FailedPrecondition,
    Aborted,
    Canceled,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::NotFound => "not_found",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::Canceled => "canceled",
            Code::Internal => "internal",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> Code {
        match self {
            DispatchError::NotFound(_) => Code::NotFound,
            DispatchError::FailedPrecondition(_) => Code::FailedPrecondition,
            DispatchError::Aborted(_) => Code::Aborted,
            DispatchError::Canceled(_) => Code::Canceled,
            DispatchError::Internal(_) => Code::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DispatchError::NotFound(m)
            | DispatchError::FailedPrecondition(m)
            | DispatchError::Aborted(m)
            | DispatchError::Canceled(m)
            | DispatchError::Internal(m) => m,
        }
    }

    /// Wrap a repository failure. Storage errors always surface as `Aborted`.
    pub fn storage(err: anyhow::Error) -> Self {
        DispatchError::Aborted(format!("{:#}", err))
    }

    pub fn to_status(&self) -> Status {
        Status::new(self.code(), self.message())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Aborted(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Aborted(err.to_string())
    }
}

impl From<Status> for DispatchError {
    fn from(status: Status) -> Self {
        match status.code {
            Code::NotFound => DispatchError::NotFound(status.message),
            Code::FailedPrecondition => DispatchError::FailedPrecondition(status.message),
            Code::Aborted => DispatchError::Aborted(status.message),
            Code::Canceled => DispatchError::Canceled(status.message),
            Code::Internal => DispatchError::Internal(status.message),
        }
    }
}

/// Structured error recorded on a failed job and sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(Code::Canceled, "canceled")
    }

    pub fn is_canceled(&self) -> bool {
        self.code == Code::Canceled
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = DispatchError::NotFound("job xyz".to_string());
        assert_eq!(err.to_string(), "Not found: job xyz");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_failed_precondition_display() {
        let err = DispatchError::FailedPrecondition("ack expected".to_string());
        assert_eq!(err.to_string(), "Failed precondition: ack expected");
        assert_eq!(err.message(), "ack expected");
    }

    #[test]
    fn test_internal_display() {
        let err = DispatchError::Internal("job disappeared".to_string());
        assert_eq!(err.to_string(), "Internal error: job disappeared");
    }

    #[test]
    fn test_from_io_error_is_aborted() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: DispatchError = io_err.into();
        match err {
            DispatchError::Aborted(msg) => assert!(msg.contains("disk full")),
            other => panic!("Expected Aborted, got: {:?}", other),
        }
    }

    #[test]
    fn test_from_serde_json_error_is_aborted() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: DispatchError = json_err.into();
        assert_eq!(err.code(), Code::Aborted);
    }

    #[test]
    fn test_storage_wraps_anyhow_context() {
        let err = DispatchError::storage(
            anyhow::anyhow!("rename failed").context("Failed to persist jobs"),
        );
        assert_eq!(err.code(), Code::Aborted);
        assert!(err.message().contains("Failed to persist jobs"));
        assert!(err.message().contains("rename failed"));
    }

    #[test]
    fn test_canceled_status() {
        let status = Status::canceled();
        assert!(status.is_canceled());
        assert_eq!(status.message, "canceled");
        assert_eq!(status.to_string(), "canceled: canceled");
    }

    #[test]
    fn test_status_roundtrips_into_error() {
        let err = DispatchError::FailedPrecondition("bad".to_string());
        let back: DispatchError = err.to_status().into();
        assert_eq!(back, err);
    }

    #[test]
    fn test_status_serializes_snake_case_code() {
        let json = serde_json::to_string(&Status::new(Code::FailedPrecondition, "x"))
            .expect("serialize");
        assert_eq!(json, r#"{"code":"failed_precondition","message":"x"}"#);
    }
}
