use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stream::{recv, send, ServerStream};
use super::Dispatcher;
use crate::errors::DispatchError;
use crate::logbuffer::LogBuffer;
use crate::models::{
    Job, JobState, RunnerJobStreamRequest, RunnerJobStreamResponse, TerminalEvent,
};

type JobStream = ServerStream<RunnerJobStreamRequest, RunnerJobStreamResponse>;

impl Dispatcher {
    /// Serve one job to one runner.
    ///
    /// The runner opens with a `Request`, blocks until a job is assigned,
    /// acks it, then streams heartbeats, output and finally a `Complete` or
    /// `Error`. Cancellation requests flow the other way.
    pub async fn runner_job_stream(
        &self,
        token: CancellationToken,
        stream: JobStream,
    ) -> Result<(), DispatchError> {
        let ServerStream {
            mut incoming,
            outgoing,
        } = stream;
        let token = token.child_token();
        let _cancel_on_exit = token.clone().drop_guard();

        let runner_id = match recv(&mut incoming).await? {
            Some(RunnerJobStreamRequest::Request { runner_id }) => runner_id,
            Some(other) => {
                return Err(DispatchError::FailedPrecondition(format!(
                    "first message must be a request, got: {}",
                    other.kind()
                )))
            }
            None => return Ok(()),
        };
        let runner = self.runners.get_by_id(&runner_id)?;
        tracing::debug!("Runner '{}' waiting for a job", runner.id);

        // The runner has nothing to say until it gets a job, so anything
        // arriving now (usually end of stream) abandons the wait.
        let assign = self.jobs.assign_for_runner(&token, &runner);
        tokio::pin!(assign);
        let job = tokio::select! {
            job = &mut assign => job?,
            early = recv(&mut incoming) => {
                token.cancel();
                let outcome = match early {
                    Ok(None) => Ok(()),
                    Ok(Some(req)) => Err(DispatchError::FailedPrecondition(format!(
                        "unexpected {} before assignment",
                        req.kind()
                    ))),
                    Err(e) => Err(e),
                };
                if let Ok(job) = assign.await {
                    self.jobs.ack(job.id, false).await?;
                }
                tracing::debug!("Runner '{}' left before a job was assigned", runner.id);
                return outcome;
            }
        };

        // A failed send still goes through the nack below so the job is
        // requeued instead of sitting in WAITING until the ack timer fires.
        let mut err = send(
            &outgoing,
            RunnerJobStreamResponse::Assignment {
                job: Box::new(job.clone()),
            },
        )
        .await
        .err();

        let mut ack = false;
        if err.is_none() {
            match recv(&mut incoming).await {
                Ok(Some(RunnerJobStreamRequest::Ack)) => ack = true,
                Ok(Some(RunnerJobStreamRequest::Error { error })) => {
                    tracing::info!(
                        "Runner '{}' rejected job {}: {}",
                        runner.id,
                        job.id,
                        error
                    );
                }
                Ok(Some(other)) => {
                    err = Some(DispatchError::FailedPrecondition(format!(
                        "ack expected, got: {}",
                        other.kind()
                    )));
                }
                Ok(None) => {
                    err = Some(DispatchError::Canceled(
                        "stream closed before ack".to_string(),
                    ));
                }
                Err(e) => err = Some(e),
            }
        }

        if let Err(ack_err) = self.jobs.ack(job.id, ack).await {
            tracing::warn!(
                "Ack of job {} failed: {} (stream error: {:?})",
                job.id,
                ack_err,
                err
            );
            if err.is_none() {
                err = Some(ack_err);
            }
        }
        if let Some(e) = err {
            return Err(e);
        }
        if !ack {
            return Ok(());
        }

        let snapshot = self.jobs.get(job.id).await?;
        let output = snapshot.output;
        let mut changes = snapshot.changes;

        let (event_tx, mut event_rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        tokio::spawn(receive_events(token.clone(), incoming, event_tx, err_tx));

        let mut pending = Some(snapshot.job);
        let mut last_cancel: Option<DateTime<Utc>> = None;
        loop {
            if let Some(current) = pending.take() {
                if current.cancel_time.is_some() && current.cancel_time != last_cancel {
                    // Only a forced cancel can have moved a live job to ERROR.
                    let force = current.state == JobState::Error;
                    tracing::info!(
                        "Sending cancel for job {} to runner '{}' (force: {})",
                        job.id,
                        runner.id,
                        force
                    );
                    send(&outgoing, RunnerJobStreamResponse::Cancel { force }).await?;
                    if force {
                        return Ok(());
                    }
                }
                last_cancel = current.cancel_time;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    if let Ok(e) = err_rx.try_recv() {
                        return Err(e);
                    }
                    while let Ok(req) = event_rx.try_recv() {
                        self.handle_job_stream_request(job.id, output.as_ref(), req).await?;
                    }
                    return Ok(());
                }
                Some(e) = err_rx.recv() => return Err(e),
                Some(req) = event_rx.recv() => {
                    self.handle_job_stream_request(job.id, output.as_ref(), req).await?;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(job_disappeared(job.id));
                    }
                    let current: Job = self
                        .jobs
                        .get(job.id)
                        .await
                        .map_err(|_| job_disappeared(job.id))?
                        .job;
                    pending = Some(current);
                }
            }
        }
    }

    async fn handle_job_stream_request(
        &self,
        id: Uuid,
        output: Option<&LogBuffer<TerminalEvent>>,
        req: RunnerJobStreamRequest,
    ) -> Result<(), DispatchError> {
        match req {
            RunnerJobStreamRequest::Complete { result } => self.jobs.complete(id, result, None).await,
            RunnerJobStreamRequest::Error { error } => {
                self.jobs.complete(id, None, Some(error)).await
            }
            RunnerJobStreamRequest::Heartbeat => self.jobs.heartbeat(id).await,
            RunnerJobStreamRequest::Terminal { events } => {
                match output {
                    Some(buffer) => buffer.write(&events),
                    None => tracing::warn!(
                        "Dropping {} output events for job {}: no output buffer",
                        events.len(),
                        id
                    ),
                }
                Ok(())
            }
            other => {
                tracing::warn!("Unexpected {} event on stream for job {}", other.kind(), id);
                Ok(())
            }
        }
    }
}

fn job_disappeared(id: Uuid) -> DispatchError {
    DispatchError::Internal(format!("job disappeared: {}", id))
}

/// Pump runner events into `events` until end of stream or a terminal event.
/// Cancels `token` on the way out so the main loop drains and returns.
async fn receive_events(
    token: CancellationToken,
    mut incoming: mpsc::Receiver<Result<RunnerJobStreamRequest, DispatchError>>,
    events: mpsc::Sender<RunnerJobStreamRequest>,
    errors: mpsc::Sender<DispatchError>,
) {
    let _cancel_on_exit = token.clone().drop_guard();
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return,
            msg = recv(&mut incoming) => msg,
        };

        let req = match msg {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                let _ = errors.try_send(e);
                return;
            }
        };

        let finished = matches!(
            req,
            RunnerJobStreamRequest::Complete { .. } | RunnerJobStreamRequest::Error { .. }
        );
        tokio::select! {
            _ = token.cancelled() => return,
            sent = events.send(req) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if finished {
            tracing::debug!("Job stream receive loop done after final event");
            return;
        }
    }
}
