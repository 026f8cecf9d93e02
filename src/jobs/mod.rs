mod timer;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{DispatchError, Status};
use crate::logbuffer::LogBuffer;
use crate::models::{Job, JobState, Runner, ServerConfig, TargetRunner, TerminalEvent};
use crate::registry::RunnerRegistry;
use crate::storage::JobRepository;

use timer::StateTimer;

/// Timeouts and output buffer sizing for a [`JobStore`].
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    pub ack_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub log_chunk_count: usize,
    pub log_chunk_size: usize,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(120),
            heartbeat_timeout: Duration::from_secs(120),
            log_chunk_count: crate::logbuffer::DEFAULT_CHUNK_COUNT,
            log_chunk_size: crate::logbuffer::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&ServerConfig> for JobStoreConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
            log_chunk_count: config.log_chunk_count,
            log_chunk_size: config.log_chunk_size,
        }
    }
}

/// A point-in-time view of one job.
pub struct JobSnapshot {
    pub job: Job,
    /// Only meaningful for QUEUED jobs: another job holds the scope.
    pub blocked: bool,
    /// Present from the first ack onwards.
    pub output: Option<LogBuffer<TerminalEvent>>,
    /// Fires on every later change to this job, and closes when the job is
    /// pruned.
    pub changes: watch::Receiver<u64>,
}

struct JobIndex {
    job: Job,
    /// Ack timer while WAITING, heartbeat timer while RUNNING.
    state_timer: Option<StateTimer>,
    /// Bumped whenever `state_timer` is replaced so a stale callback can
    /// recognise itself.
    timer_epoch: u64,
    expiry_timer: Option<StateTimer>,
    output: Option<LogBuffer<TerminalEvent>>,
    changes: watch::Sender<u64>,
}

impl JobIndex {
    fn new(job: Job) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            job,
            state_timer: None,
            timer_epoch: 0,
            expiry_timer: None,
            output: None,
            changes,
        }
    }

    fn set_timer(&mut self, timer: Option<StateTimer>) {
        self.state_timer = timer;
        self.timer_epoch += 1;
    }

    /// Release everything a terminal job no longer needs.
    fn finish(&mut self) {
        self.set_timer(None);
        self.expiry_timer = None;
        if let Some(output) = &self.output {
            output.close();
        }
    }
}

#[derive(Default)]
struct Table {
    jobs: HashMap<Uuid, JobIndex>,
    /// Scope resource id -> exclusive job currently assigned on it.
    assigned: HashMap<String, Uuid>,
}

impl Table {
    fn is_blocked(&self, job: &Job) -> bool {
        if !job.is_exclusive() {
            return false;
        }
        matches!(self.assigned.get(job.scope.resource_id()), Some(holder) if *holder != job.id)
    }

    fn set_assigned(&mut self, job: &Job, assigned: bool) {
        if !job.is_exclusive() {
            return;
        }
        let key = job.scope.resource_id();
        if assigned {
            self.assigned.insert(key.to_string(), job.id);
        } else if self.assigned.get(key) == Some(&job.id) {
            self.assigned.remove(key);
        }
    }

    fn assignable(&self) -> impl Iterator<Item = &Job> + '_ {
        self.jobs
            .values()
            .map(|idx| &idx.job)
            .filter(move |job| job.state == JobState::Queued && !self.is_blocked(job))
    }

    /// Unblocked QUEUED jobs this runner may take, in the order they should
    /// be offered: jobs targeted at the runner by id first, then untargeted
    /// jobs, each oldest first.
    fn candidates(&self, runner: &Runner) -> Vec<Uuid> {
        let mut by_id: Vec<&Job> = self
            .assignable()
            .filter(|job| matches!(&job.target_runner, TargetRunner::Id(id) if *id == runner.id))
            .collect();
        by_id.sort_by_key(|job| (job.queue_time, job.id));

        let mut any: Vec<&Job> = if runner.by_id_only {
            Vec::new()
        } else {
            self.assignable()
                .filter(|job| job.target_runner == TargetRunner::Any)
                .collect()
        };
        any.sort_by_key(|job| (job.queue_time, job.id));

        by_id.into_iter().chain(any).map(|job| job.id).collect()
    }
}

struct Inner {
    repo: Arc<JobRepository>,
    runners: Arc<RunnerRegistry>,
    table: RwLock<Table>,
    /// Bumped on every committed change to any job.
    revision: watch::Sender<u64>,
    config: JobStoreConfig,
}

/// The job queue and its state machine.
///
/// Every transition is written to the repository before the in-memory index
/// changes, so a storage failure leaves the job exactly as it was.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<Inner>,
}

fn not_found(id: Uuid) -> DispatchError {
    DispatchError::NotFound(format!("job '{}' not found", id))
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_nanos(1))
}

impl JobStore {
    /// Load every persisted job and restore timers and assignment marks for
    /// jobs that were in flight.
    pub async fn open(
        repo: Arc<JobRepository>,
        runners: Arc<RunnerRegistry>,
        config: JobStoreConfig,
    ) -> Result<Self, DispatchError> {
        let jobs = repo.load_all().await.map_err(DispatchError::storage)?;
        let (revision, _) = watch::channel(0);
        let store = Self {
            inner: Arc::new(Inner {
                repo,
                runners,
                table: RwLock::new(Table::default()),
                revision,
                config,
            }),
        };
        store.recover(jobs).await;
        Ok(store)
    }

    async fn recover(&self, jobs: Vec<Job>) {
        let mut table = self.inner.table.write().await;
        let mut in_flight = 0usize;

        for job in jobs {
            let id = job.id;
            let mut idx = JobIndex::new(job);
            match idx.job.state {
                JobState::Waiting => {
                    table.set_assigned(&idx.job, true);
                    let timer = self.ack_timer(id, idx.timer_epoch + 1);
                    idx.set_timer(Some(timer));
                    in_flight += 1;
                }
                JobState::Running => {
                    table.set_assigned(&idx.job, true);
                    let timer = self.heartbeat_timer(id, idx.timer_epoch + 1);
                    idx.set_timer(Some(timer));
                    idx.output = Some(self.new_output());
                    in_flight += 1;
                }
                _ => {}
            }
            if !idx.job.state.is_terminal() {
                if let Some(at) = idx.job.expire_time {
                    idx.expiry_timer = Some(self.expiry_timer(id, at));
                }
            }
            table.jobs.insert(id, idx);
        }

        if !table.jobs.is_empty() {
            tracing::info!(
                "Recovered {} jobs ({} in flight)",
                table.jobs.len(),
                in_flight
            );
        }
    }

    fn new_output(&self) -> LogBuffer<TerminalEvent> {
        LogBuffer::with_chunks(
            self.inner.config.log_chunk_count,
            self.inner.config.log_chunk_size,
        )
    }

    fn ack_timer(&self, id: Uuid, epoch: u64) -> StateTimer {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.ack_timeout;
        StateTimer::start(timeout, async move {
            let Some(store) = upgrade(&weak) else {
                return;
            };
            tracing::info!("Job {} not acked within {:?}, requeueing", id, timeout);
            if let Err(e) = store.ack_inner(id, false, Some(epoch)).await {
                tracing::debug!("Ack timeout for job {} ignored: {}", id, e);
            }
        })
    }

    fn heartbeat_timer(&self, id: Uuid, epoch: u64) -> StateTimer {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.heartbeat_timeout;
        StateTimer::start(timeout, async move {
            let Some(store) = upgrade(&weak) else {
                return;
            };
            tracing::warn!("Job {} missed heartbeats for {:?}, failing it", id, timeout);
            if let Err(e) = store.cancel_inner(id, true, Some(epoch)).await {
                tracing::debug!("Heartbeat timeout for job {} ignored: {}", id, e);
            }
        })
    }

    fn expiry_timer(&self, id: Uuid, at: DateTime<Utc>) -> StateTimer {
        let weak = Arc::downgrade(&self.inner);
        StateTimer::start(until(at), async move {
            let Some(store) = upgrade(&weak) else {
                return;
            };
            if let Err(e) = store.expire(id).await {
                tracing::debug!("Expiry for job {} ignored: {}", id, e);
            }
        })
    }

    async fn persist(&self, job: &Job) -> Result<(), DispatchError> {
        self.inner.repo.put(job).await.map_err(|e| {
            tracing::error!("Failed to persist job {}: {:#}", job.id, e);
            DispatchError::storage(e)
        })
    }

    fn notify(&self, idx: &JobIndex) {
        idx.changes.send_modify(|v| *v += 1);
        self.inner.revision.send_modify(|v| *v += 1);
    }

    /// Queue a new job. The job's state and queue time are overwritten.
    pub async fn create(&self, mut job: Job) -> Result<Job, DispatchError> {
        job.state = JobState::Queued;
        job.queue_time = Utc::now();

        let mut table = self.inner.table.write().await;
        if table.jobs.contains_key(&job.id) {
            return Err(DispatchError::FailedPrecondition(format!(
                "job '{}' already exists",
                job.id
            )));
        }
        self.persist(&job).await?;

        let mut idx = JobIndex::new(job.clone());
        if let Some(at) = job.expire_time {
            idx.expiry_timer = Some(self.expiry_timer(job.id, at));
        }
        self.notify(&idx);
        table.jobs.insert(job.id, idx);

        tracing::info!(
            "Queued job {} ({} on {} '{}', target: {})",
            job.id,
            job.operation.kind,
            job.scope.kind(),
            job.scope.resource_id(),
            job.target_runner
        );
        Ok(job)
    }

    /// All known jobs, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let table = self.inner.table.read().await;
        let mut jobs: Vec<Job> = table.jobs.values().map(|idx| idx.job.clone()).collect();
        jobs.sort_by_key(|job| (job.queue_time, job.id));
        jobs
    }

    pub async fn get(&self, id: Uuid) -> Result<JobSnapshot, DispatchError> {
        let table = self.inner.table.read().await;
        let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;
        Ok(JobSnapshot {
            job: idx.job.clone(),
            blocked: idx.job.state == JobState::Queued && table.is_blocked(&idx.job),
            output: idx.output.clone(),
            changes: idx.changes.subscribe(),
        })
    }

    /// Wait for a job this runner may run and move it to WAITING.
    ///
    /// Blocks until a candidate appears or `token` is cancelled.
    pub async fn assign_for_runner(
        &self,
        token: &CancellationToken,
        runner: &Runner,
    ) -> Result<Job, DispatchError> {
        loop {
            let (candidates, mut changes) = {
                let table = self.inner.table.read().await;
                (table.candidates(runner), self.inner.revision.subscribe())
            };

            if candidates.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(DispatchError::Canceled("context canceled".to_string()));
                    }
                    changed = changes.changed() => {
                        changed.map_err(|_| {
                            DispatchError::Internal("job store closed".to_string())
                        })?;
                    }
                }
                continue;
            }

            let mut table = self.inner.table.write().await;
            for id in candidates {
                // Anything may have happened between the read and write locks.
                let Some(idx) = table.jobs.get(&id) else {
                    continue;
                };
                if idx.job.state != JobState::Queued || table.is_blocked(&idx.job) {
                    continue;
                }

                let mut job = idx.job.clone();
                job.state = JobState::Waiting;
                job.assign_time = Some(Utc::now());
                self.persist(&job).await?;

                let idx = table
                    .jobs
                    .get_mut(&id)
                    .ok_or_else(|| DispatchError::Internal("job vanished".to_string()))?;
                let timer = self.ack_timer(id, idx.timer_epoch + 1);
                idx.set_timer(Some(timer));
                idx.job = job.clone();
                self.notify(idx);
                table.set_assigned(&job, true);

                tracing::info!("Assigned job {} to runner '{}'", id, runner.id);
                return Ok(job);
            }
        }
    }

    /// Accept (RUNNING) or reject (back to QUEUED) an assignment.
    pub async fn ack(&self, id: Uuid, ack: bool) -> Result<Job, DispatchError> {
        self.ack_inner(id, ack, None).await
    }

    async fn ack_inner(
        &self,
        id: Uuid,
        ack: bool,
        epoch: Option<u64>,
    ) -> Result<Job, DispatchError> {
        let mut table = self.inner.table.write().await;
        let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;
        if epoch.is_some_and(|e| e != idx.timer_epoch) {
            return Err(DispatchError::FailedPrecondition(
                "ack timer is stale".to_string(),
            ));
        }
        if idx.job.state != JobState::Waiting {
            return Err(DispatchError::FailedPrecondition(format!(
                "job can't be acked from state: {}",
                idx.job.state
            )));
        }

        let mut job = idx.job.clone();
        if ack {
            job.state = JobState::Running;
            job.ack_time = Some(Utc::now());
        } else {
            job.state = JobState::Queued;
            job.assign_time = None;
        }
        self.persist(&job).await?;

        let output = ack.then(|| self.new_output());
        let idx = table.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        let timer = ack.then(|| self.heartbeat_timer(id, idx.timer_epoch + 1));
        idx.set_timer(timer);
        if output.is_some() {
            idx.output = output;
        }
        idx.job = job.clone();
        self.notify(idx);
        if !ack {
            table.set_assigned(&job, false);
        }

        if ack {
            tracing::info!("Job {} acked, now running", id);
        } else {
            tracing::info!("Job {} nacked, requeued", id);
        }
        Ok(job)
    }

    /// Finish a RUNNING job: SUCCESS, or ERROR when `error` is set.
    pub async fn complete(
        &self,
        id: Uuid,
        result: Option<Value>,
        error: Option<Status>,
    ) -> Result<(), DispatchError> {
        let mut table = self.inner.table.write().await;
        let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;
        if idx.job.state != JobState::Running {
            return Err(DispatchError::FailedPrecondition(format!(
                "job can't be completed from state: {}",
                idx.job.state
            )));
        }

        let mut job = idx.job.clone();
        job.state = if error.is_some() {
            JobState::Error
        } else {
            JobState::Success
        };
        job.result = result;
        job.error = error;
        job.complete_time = Some(Utc::now());
        self.persist(&job).await?;

        let idx = table.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        idx.finish();
        idx.job = job.clone();
        self.notify(idx);
        table.set_assigned(&job, false);

        match &job.error {
            Some(status) => tracing::warn!("Job {} failed: {}", id, status),
            None => tracing::info!("Job {} succeeded", id),
        }
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A QUEUED job fails immediately. A WAITING or RUNNING job only records
    /// the request for its runner to act on, unless `force` is set. Completed
    /// jobs are left untouched.
    pub async fn cancel(&self, id: Uuid, force: bool) -> Result<(), DispatchError> {
        self.cancel_inner(id, force, None).await
    }

    async fn cancel_inner(
        &self,
        id: Uuid,
        force: bool,
        epoch: Option<u64>,
    ) -> Result<(), DispatchError> {
        let mut table = self.inner.table.write().await;
        if let Some(epoch) = epoch {
            let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;
            if epoch != idx.timer_epoch {
                return Err(DispatchError::FailedPrecondition(
                    "heartbeat timer is stale".to_string(),
                ));
            }
        }
        self.cancel_locked(&mut table, id, force).await
    }

    async fn cancel_locked(
        &self,
        table: &mut Table,
        id: Uuid,
        force: bool,
    ) -> Result<(), DispatchError> {
        let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;

        let mut job = idx.job.clone();
        match job.state {
            JobState::Success | JobState::Error => {
                tracing::debug!("Job {} already finished, nothing to cancel", id);
                return Ok(());
            }
            JobState::Queued => job.state = JobState::Error,
            JobState::Waiting | JobState::Running if force => job.state = JobState::Error,
            _ => {}
        }
        job.cancel_time = Some(Utc::now());
        if job.state == JobState::Error {
            job.error = Some(Status::canceled());
        }
        self.persist(&job).await?;

        let failed = job.state == JobState::Error;
        let idx = table.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        if failed {
            idx.finish();
        }
        idx.job = job.clone();
        self.notify(idx);
        if failed {
            table.set_assigned(&job, false);
            tracing::info!("Job {} canceled", id);
        } else {
            tracing::info!("Cancellation requested for job {}", id);
        }
        Ok(())
    }

    /// Reset the heartbeat timer of a RUNNING job. Other states are ignored.
    pub async fn heartbeat(&self, id: Uuid) -> Result<(), DispatchError> {
        let table = self.inner.table.read().await;
        let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;
        if idx.job.state != JobState::Running {
            return Ok(());
        }
        match &idx.state_timer {
            Some(timer) if !timer.has_fired() => {
                timer.reset(self.inner.config.heartbeat_timeout)
            }
            _ => tracing::info!("Heartbeat for job {} without a live timer", id),
        }
        Ok(())
    }

    /// Cancel a job whose expiry passed before it started running.
    pub async fn expire(&self, id: Uuid) -> Result<(), DispatchError> {
        let mut table = self.inner.table.write().await;
        let idx = table.jobs.get(&id).ok_or_else(|| not_found(id))?;
        if !matches!(idx.job.state, JobState::Queued | JobState::Waiting) {
            return Ok(());
        }
        tracing::info!("Job {} expired", id);
        self.cancel_locked(&mut table, id, false).await
    }

    /// Whether some connected runner could currently take `job`.
    ///
    /// The answer may be stale by the time the caller acts on it.
    pub fn is_assignable(&self, job: &Job) -> bool {
        let runners = &self.inner.runners;
        if runners.is_empty() {
            return false;
        }
        match &job.target_runner {
            TargetRunner::Any => runners.any_accepts_untargeted(),
            TargetRunner::Id(id) => runners.contains(id),
        }
    }

    /// Delete the oldest finished jobs so that at most `max` remain.
    /// Unfinished jobs are never pruned. Returns the number removed.
    pub async fn prune_old(&self, max: usize) -> Result<usize, DispatchError> {
        let mut table = self.inner.table.write().await;

        let mut finished: Vec<&Job> = table
            .jobs
            .values()
            .map(|idx| &idx.job)
            .filter(|job| job.state.is_terminal())
            .collect();
        finished.sort_by_key(|job| std::cmp::Reverse((job.queue_time, job.id)));
        let doomed: Vec<Uuid> = finished.iter().skip(max).map(|job| job.id).collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        self.inner
            .repo
            .delete(&doomed)
            .await
            .map_err(DispatchError::storage)?;

        for id in &doomed {
            if let Some(mut idx) = table.jobs.remove(id) {
                idx.finish();
            }
        }
        tracing::info!("Pruned {} finished jobs", doomed.len());
        Ok(doomed.len())
    }

    /// Stop all timers and close output buffers.
    pub async fn shutdown(&self) {
        let mut table = self.inner.table.write().await;
        for idx in table.jobs.values_mut() {
            idx.set_timer(None);
            idx.expiry_timer = None;
            if let Some(output) = &idx.output {
                output.close();
            }
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<JobStore> {
    weak.upgrade().map(|inner| JobStore { inner })
}
