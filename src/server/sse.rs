use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::routes::{parse_job_id, ApiError};
use super::AppState;
use crate::models::GetJobStreamResponse;

/// Guard that cancels the observer and logs when the SSE stream is dropped.
struct SseDropGuard {
    token: CancellationToken,
    job_id: uuid::Uuid,
}

impl Drop for SseDropGuard {
    fn drop(&mut self) {
        self.token.cancel();
        tracing::debug!("SSE observer for job {} disconnected", self.job_id);
    }
}

/// `GET /api/jobs/{id}/stream`: the job's state and output as SSE events
/// named after the message kind.
pub async fn job_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id = parse_job_id(&id)?;
    // Fail with a proper 404 before committing to an event stream.
    state.dispatcher.get_job(job_id).await?;
    tracing::info!("SSE observer attached to job {}", job_id);

    let (tx, rx) = mpsc::channel::<GetJobStreamResponse>(64);
    let token = state.shutdown.child_token();
    let dispatcher = state.dispatcher.clone();
    let observer_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.get_job_stream(job_id, observer_token, tx).await {
            tracing::debug!("Job stream for {} ended: {}", job_id, e);
        }
    });

    let drop_guard = SseDropGuard { token, job_id };
    let stream = ReceiverStream::new(rx).filter_map(move |msg| {
        let _ = &drop_guard;
        match serde_json::to_string(&msg) {
            Ok(data) => Some(Ok(Event::default().event(msg.kind()).data(data))),
            Err(e) => {
                tracing::warn!("Failed to encode {} event: {}", msg.kind(), e);
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.sse_keepalive_secs.max(1)))
            .text("keepalive"),
    ))
}
