pub mod observe;
pub mod runner_config;
pub mod runner_stream;
pub mod stream;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DispatchError, Status};
use crate::jobs::JobStore;
use crate::models::job::{parse_duration, validate_new_job};
use crate::models::{ConfigVar, Job, NewJob, Runner};
use crate::registry::{ConfigStore, RunnerRegistry};

pub use stream::{ClientStream, ServerStream};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueJobRequest {
    #[serde(default)]
    pub job: Option<NewJob>,
    /// Go-style duration such as `10ms` or `1h30m`.
    #[serde(default)]
    pub expires_in: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJobResponse {
    pub job_id: Uuid,
}

/// A job plus whether it is currently held back by an exclusive job on the
/// same scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateJobResponse {
    pub valid: bool,
    pub assignable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<Status>,
}

/// The operations exposed to clients and runners, independent of transport.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: JobStore,
    runners: Arc<RunnerRegistry>,
    config_vars: Arc<ConfigStore>,
}

impl Dispatcher {
    pub fn new(jobs: JobStore, runners: Arc<RunnerRegistry>, config_vars: Arc<ConfigStore>) -> Self {
        Self {
            jobs,
            runners,
            config_vars,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    pub fn config_vars(&self) -> &ConfigStore {
        &self.config_vars
    }

    pub async fn queue_job(&self, req: QueueJobRequest) -> Result<Job, DispatchError> {
        let new_job = req
            .job
            .ok_or_else(|| DispatchError::FailedPrecondition("job must be set".to_string()))?;

        let now = Utc::now();
        let mut job = new_job.into_job(Uuid::now_v7(), now)?;

        if let Some(expires_in) = req.expires_in.as_deref().filter(|s| !s.is_empty()) {
            let dur = parse_duration(expires_in)?;
            let dur = chrono::Duration::from_std(dur).map_err(|e| {
                DispatchError::FailedPrecondition(format!("Invalid expiry duration: {}", e))
            })?;
            job.expire_time = Some(now + dur);
        }

        self.jobs.create(job).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobView, DispatchError> {
        let snapshot = self.jobs.get(id).await?;
        Ok(JobView {
            job: snapshot.job,
            blocked: snapshot.blocked,
        })
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.list().await
    }

    /// Check a job without queueing it.
    pub fn validate_job(&self, new_job: &NewJob) -> ValidateJobResponse {
        if let Err(e) = validate_new_job(new_job) {
            return ValidateJobResponse {
                valid: false,
                assignable: false,
                validation_error: Some(e.to_status()),
            };
        }

        let assignable = match new_job.clone().into_job(Uuid::nil(), Utc::now()) {
            Ok(job) => self.jobs.is_assignable(&job),
            Err(_) => false,
        };
        ValidateJobResponse {
            valid: true,
            assignable,
            validation_error: None,
        }
    }

    /// Request cancellation. Never fails for a job that already finished.
    pub async fn cancel_job(&self, id: Uuid) -> Result<(), DispatchError> {
        self.jobs.cancel(id, false).await
    }

    pub async fn prune_old_jobs(&self, max: usize) -> Result<usize, DispatchError> {
        self.jobs.prune_old(max).await
    }

    pub fn list_runners(&self) -> Vec<Runner> {
        self.runners.list()
    }

    pub fn get_runner(&self, id: &str) -> Result<Runner, DispatchError> {
        self.runners.get_by_id(id)
    }

    pub fn set_config(&self, vars: Vec<ConfigVar>) {
        self.config_vars.set(vars);
    }
}
