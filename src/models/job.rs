use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DispatchError, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Unknown,
    Queued,
    Waiting,
    Running,
    Success,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Error)
    }

    /// WAITING and RUNNING jobs hold their scope's assignment mark.
    pub fn is_assigned(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Unknown => "UNKNOWN",
            JobState::Queued => "QUEUED",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_id: String,
    #[serde(default)]
    pub name: String,
}

impl ResourceRef {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            name: String::new(),
        }
    }
}

/// The entity a job is attached to. Exclusive operations block per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "ref", rename_all = "snake_case")]
pub enum Scope {
    Basis(ResourceRef),
    Project(ResourceRef),
    Target(ResourceRef),
}

impl Scope {
    pub fn resource(&self) -> &ResourceRef {
        match self {
            Scope::Basis(r) | Scope::Project(r) | Scope::Target(r) => r,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource().resource_id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Basis(_) => "basis",
            Scope::Project(_) => "project",
            Scope::Target(_) => "target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TargetRunner {
    #[default]
    Any,
    Id(String),
}

impl fmt::Display for TargetRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRunner::Any => f.write_str("any"),
            TargetRunner::Id(id) => write!(f, "id:{}", id),
        }
    }
}

/// Opaque unit of work. `exclusive` marks operation kinds that may not run
/// concurrently with another job on the same scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub scope: Scope,
    pub target_runner: TargetRunner,
    pub operation: Operation,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub state: JobState,
    pub queue_time: DateTime<Utc>,
    #[serde(default)]
    pub assign_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ack_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<Status>,
}

impl Job {
    /// A job is only ever blocked by a job of an exclusive operation kind.
    pub fn is_exclusive(&self) -> bool {
        self.operation.exclusive
    }
}

/// A job as submitted by a client, before it is validated and queued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub target_runner: Option<TargetRunner>,
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NewJob {
    /// Validate and turn the request into a QUEUED job.
    pub fn into_job(self, id: Uuid, now: DateTime<Utc>) -> Result<Job, DispatchError> {
        validate_new_job(&self)?;
        let (Some(scope), Some(target_runner), Some(operation)) =
            (self.scope, self.target_runner, self.operation)
        else {
            return Err(DispatchError::Internal(
                "validated job is missing a field".to_string(),
            ));
        };

        Ok(Job {
            id,
            scope,
            target_runner,
            operation,
            labels: self.labels,
            state: JobState::Queued,
            queue_time: now,
            assign_time: None,
            ack_time: None,
            complete_time: None,
            cancel_time: None,
            expire_time: None,
            result: None,
            error: None,
        })
    }
}

/// Validate a NewJob before it is queued.
pub fn validate_new_job(job: &NewJob) -> Result<(), DispatchError> {
    let scope = job
        .scope
        .as_ref()
        .ok_or_else(|| DispatchError::FailedPrecondition("scope must be set".to_string()))?;
    if scope.resource_id().trim().is_empty() {
        return Err(DispatchError::FailedPrecondition(format!(
            "{} scope must have a resource id",
            scope.kind()
        )));
    }

    match &job.target_runner {
        None => {
            return Err(DispatchError::FailedPrecondition(
                "target runner must be set".to_string(),
            ))
        }
        Some(TargetRunner::Id(id)) if id.trim().is_empty() => {
            return Err(DispatchError::FailedPrecondition(
                "target runner id cannot be empty".to_string(),
            ))
        }
        Some(_) => {}
    }

    let operation = job
        .operation
        .as_ref()
        .ok_or_else(|| DispatchError::FailedPrecondition("operation must be set".to_string()))?;
    if operation.kind.trim().is_empty() {
        return Err(DispatchError::FailedPrecondition(
            "operation kind cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Parse a duration such as `10ms`, `2.5s` or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, DispatchError> {
    let invalid = || DispatchError::FailedPrecondition("Invalid expiry duration".to_string());

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total.round() as u64))
}
