use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stream::send;
use super::Dispatcher;
use crate::errors::DispatchError;
use crate::jobs::JobSnapshot;
use crate::logbuffer::{LogBuffer, Reader};
use crate::models::{GetJobStreamResponse, JobState, TerminalEvent};

/// Entries per live output read.
const OUTPUT_BATCH: usize = 64;

type Outgoing = mpsc::Sender<GetJobStreamResponse>;

/// Live output for one observer. Reads never block: the observer waits for
/// the buffer's write signal and then takes whatever its reader can see, so
/// an observer that stops consuming falls behind the window instead of
/// holding output.
struct OutputStream {
    reader: Reader<TerminalEvent>,
    wake: watch::Receiver<u64>,
}

impl OutputStream {
    /// Attach to `buffer`. Returns the stream and everything written before
    /// the attach, which goes out as one buffered batch.
    fn attach(buffer: &LogBuffer<TerminalEvent>) -> (Self, Vec<TerminalEvent>) {
        let wake = buffer.subscribe();
        let mut reader = buffer.reader(-1);
        let history = reader.drain();
        (Self { reader, wake }, history)
    }

    /// The next batch of output, or `None` once the reader is closed.
    async fn next(&mut self) -> Option<Vec<TerminalEvent>> {
        loop {
            self.wake.borrow_and_update();
            if let Some(batch) = self.reader.read(OUTPUT_BATCH, false) {
                return Some(batch);
            }
            if self.reader.is_closed() || self.wake.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Stop following and send whatever the reader has not forwarded yet.
    async fn finish(&mut self, outgoing: &Outgoing) -> Result<(), DispatchError> {
        self.reader.close();
        let rest = self.reader.drain();
        if !rest.is_empty() {
            send_live(outgoing, rest).await?;
        }
        Ok(())
    }
}

async fn send_live(outgoing: &Outgoing, events: Vec<TerminalEvent>) -> Result<(), DispatchError> {
    send(
        outgoing,
        GetJobStreamResponse::Terminal {
            events,
            buffered: false,
        },
    )
    .await
}

async fn next_output(output: &mut Option<OutputStream>) -> Option<Vec<TerminalEvent>> {
    match output {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    /// Follow a job's state and output until it finishes or `token` is
    /// cancelled. Cancellation ends the stream without an error.
    pub async fn get_job_stream(
        &self,
        id: Uuid,
        token: CancellationToken,
        outgoing: Outgoing,
    ) -> Result<(), DispatchError> {
        let snapshot = self.jobs.get(id).await.map_err(|e| match e {
            DispatchError::NotFound(_) => {
                DispatchError::NotFound(format!("job not found for ID: {}", id))
            }
            other => other,
        })?;
        send(&outgoing, GetJobStreamResponse::Open).await?;
        tracing::debug!("Observer attached to job {}", id);

        let JobSnapshot {
            job,
            output: buffer,
            mut changes,
            ..
        } = snapshot;
        let mut pending = Some((job, buffer));
        let mut last_state = JobState::Unknown;
        let mut cancel_sent = false;
        let mut output: Option<OutputStream> = None;

        loop {
            if let Some((job, buffer)) = pending.take() {
                // Attach before reporting the state so that output written
                // after an observer sees RUNNING always arrives live.
                let mut history = Vec::new();
                if output.is_none() {
                    if let Some(buffer) = buffer {
                        let (stream, written) = OutputStream::attach(&buffer);
                        output = Some(stream);
                        history = written;
                    }
                }

                let canceling = job.cancel_time.is_some();
                if last_state != job.state || cancel_sent != canceling {
                    send(
                        &outgoing,
                        GetJobStreamResponse::State {
                            previous: last_state,
                            current: job.state,
                            job: Box::new(job.clone()),
                            canceling,
                        },
                    )
                    .await?;
                    last_state = job.state;
                    cancel_sent = canceling;
                }

                if !history.is_empty() {
                    send(
                        &outgoing,
                        GetJobStreamResponse::Terminal {
                            events: history,
                            buffered: true,
                        },
                    )
                    .await?;
                }

                if job.state.is_terminal() {
                    if let Some(stream) = output.as_mut() {
                        stream.finish(&outgoing).await?;
                    }
                    return send(
                        &outgoing,
                        GetJobStreamResponse::Complete {
                            error: job.error,
                            result: job.result,
                        },
                    )
                    .await;
                }
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                changed = changes.changed() => {
                    let disappeared = || {
                        DispatchError::Internal(format!("job disappeared for ID: {}", id))
                    };
                    if changed.is_err() {
                        return Err(disappeared());
                    }
                    let snapshot = self.jobs.get(id).await.map_err(|_| disappeared())?;
                    pending = Some((snapshot.job, snapshot.output));
                }
                Some(events) = next_output(&mut output) => {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        sent = send_live(&outgoing, events) => sent?,
                    }
                }
            }
        }
    }
}
