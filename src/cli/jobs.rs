// CLI job commands: queue, list, get, cancel, prune

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use uuid::Uuid;

use super::{base_url, error_from_response, handle_request_error, parse_key_values, parse_scope};
use crate::models::{Job, NewJob, Operation, TargetRunner};
use crate::service::{JobView, QueueJobRequest, QueueJobResponse};

/// Arguments of `jobd queue`.
#[derive(Debug)]
pub struct QueueArgs<'a> {
    pub scope: &'a str,
    pub op: &'a str,
    pub exclusive: bool,
    pub runner: Option<&'a str>,
    pub payload: Option<&'a str>,
    pub labels: &'a [String],
    pub expires_in: Option<&'a str>,
}

impl QueueArgs<'_> {
    /// Build the request body, rejecting malformed flags before any request
    /// is made.
    pub fn to_request(&self) -> anyhow::Result<QueueJobRequest> {
        let scope = parse_scope(self.scope).map_err(|e| anyhow::anyhow!(e))?;
        let labels = parse_key_values(self.labels).map_err(|e| anyhow::anyhow!(e))?;
        let payload = match self.payload {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| anyhow::anyhow!("Invalid --payload JSON: {}", e))?,
            None => Value::Null,
        };
        let target_runner = match self.runner {
            Some(id) => TargetRunner::Id(id.to_string()),
            None => TargetRunner::Any,
        };

        Ok(QueueJobRequest {
            job: Some(NewJob {
                scope: Some(scope),
                target_runner: Some(target_runner),
                operation: Some(Operation {
                    kind: self.op.to_string(),
                    exclusive: self.exclusive,
                    payload,
                }),
                labels,
            }),
            expires_in: self.expires_in.map(str::to_string),
        })
    }
}

/// Format a relative time string like "2 minutes ago".
fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let secs = Utc::now().signed_duration_since(*dt).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

fn parse_job_arg(job: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(job).map_err(|_| anyhow::anyhow!("Invalid job id '{}'", job))
}

/// jobd queue
pub async fn cmd_queue(host: &str, port: u16, args: &QueueArgs<'_>) -> anyhow::Result<Uuid> {
    let request = args.to_request()?;

    let client = Client::new();
    let url = format!("{}/api/jobs", base_url(host, port));
    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let body: QueueJobResponse = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    println!("Job queued.");
    println!("  ID:        {}", body.job_id);
    println!("  Scope:     {}", args.scope);
    println!("  Operation: {}", args.op);
    Ok(body.job_id)
}

/// jobd list
pub async fn cmd_list(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs", base_url(host, port));
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let jobs: Vec<Job> = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<9} {:<24} {:<14} {:<12} QUEUED",
        "ID", "STATE", "SCOPE", "OPERATION", "RUNNER"
    );
    for job in &jobs {
        let scope = format!("{}:{}", job.scope.kind(), job.scope.resource_id());
        println!(
            "{:<38} {:<9} {:<24} {:<14} {:<12} {}",
            job.id,
            job.state.to_string(),
            scope,
            job.operation.kind,
            job.target_runner.to_string(),
            format_relative_time(&job.queue_time)
        );
    }

    Ok(())
}

/// jobd get
pub async fn cmd_get(host: &str, port: u16, job: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_job_arg(job)?;
    let client = Client::new();
    let url = format!("{}/api/jobs/{}", base_url(host, port), id);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let view: JobView = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let job = &view.job;
    println!("ID:        {}", job.id);
    println!("State:     {}", job.state);
    println!(
        "Scope:     {}:{}",
        job.scope.kind(),
        job.scope.resource_id()
    );
    println!(
        "Operation: {}{}",
        job.operation.kind,
        if job.operation.exclusive { " (exclusive)" } else { "" }
    );
    println!("Runner:    {}", job.target_runner);
    println!("Blocked:   {}", view.blocked);
    println!("Queued:    {}", format_relative_time(&job.queue_time));
    if let Some(t) = job.assign_time {
        println!("Assigned:  {}", format_relative_time(&t));
    }
    if let Some(t) = job.complete_time {
        println!("Completed: {}", format_relative_time(&t));
    }
    if let Some(t) = job.cancel_time {
        println!("Canceled:  {}", format_relative_time(&t));
    }
    if let Some(ref error) = job.error {
        println!("Error:     {}", error);
    }
    if let Some(ref result) = job.result {
        println!("Result:    {}", result);
    }

    Ok(())
}

/// jobd cancel
pub async fn cmd_cancel(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let id = parse_job_arg(job)?;
    let client = Client::new();
    let url = format!("{}/api/jobs/{}/cancel", base_url(host, port), id);
    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let view: JobView = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if view.job.state.is_terminal() {
        println!("Job {} canceled ({}).", id, view.job.state);
    } else {
        println!("Cancellation requested for job {} ({}).", id, view.job.state);
    }
    Ok(())
}

/// jobd prune
pub async fn cmd_prune(host: &str, port: u16, max: Option<usize>) -> anyhow::Result<()> {
    let client = Client::new();
    let mut url = format!("{}/api/jobs/prune", base_url(host, port));
    if let Some(max) = max {
        url.push_str(&format!("?max={}", max));
    }

    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;
    println!("Pruned {} jobs.", body["pruned"].as_u64().unwrap_or(0));
    Ok(())
}
