use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::errors::DispatchError;
use crate::service::stream::{self, ClientStream};

/// `GET /api/runners/config/ws`
pub async fn runner_config_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (server, client) = stream::pair(16);
        let token = state.shutdown.child_token();
        let dispatcher = state.dispatcher.clone();
        let service_token = token.clone();
        serve_socket(socket, client, token, async move {
            dispatcher.runner_config(service_token, server).await
        })
        .await;
    })
}

/// `GET /api/runners/jobs/ws`
pub async fn runner_jobs_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (server, client) = stream::pair(16);
        let token = state.shutdown.child_token();
        let dispatcher = state.dispatcher.clone();
        let service_token = token.clone();
        serve_socket(socket, client, token, async move {
            dispatcher.runner_job_stream(service_token, server).await
        })
        .await;
    })
}

/// Bridge a WebSocket to a service stream: JSON text frames in both
/// directions, socket close as end of stream. The service's final error is
/// reported in the close frame.
async fn serve_socket<Req, Resp, F>(
    socket: WebSocket,
    client: ClientStream<Req, Resp>,
    token: CancellationToken,
    service: F,
) where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    let (mut sink, source) = socket.split();
    let ClientStream {
        requests,
        mut responses,
    } = client;

    let inbound = tokio::spawn(forward_inbound(source, requests));
    let service = tokio::spawn(service);

    while let Some(resp) = responses.recv().await {
        let json = match serde_json::to_string(&resp) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to encode stream message: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            tracing::debug!("WebSocket send failed, stopping stream");
            token.cancel();
            break;
        }
    }
    drop(responses);

    let (code, reason) = match service.await {
        Ok(Ok(())) => (close_code::NORMAL, String::new()),
        Ok(Err(e)) => {
            tracing::warn!("Runner stream ended with error: {}", e);
            (close_code::POLICY, e.to_string())
        }
        Err(e) => {
            tracing::error!("Runner stream task failed: {}", e);
            (close_code::ERROR, "internal error".to_string())
        }
    };
    inbound.abort();

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn forward_inbound<Req: DeserializeOwned>(
    mut source: SplitStream<WebSocket>,
    requests: mpsc::Sender<Result<Req, DispatchError>>,
) {
    while let Some(msg) = source.next().await {
        let item = match msg {
            Ok(Message::Text(text)) => serde_json::from_str::<Req>(text.as_str()).map_err(|e| {
                DispatchError::FailedPrecondition(format!("invalid stream message: {}", e))
            }),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => Err(DispatchError::Canceled(format!("websocket error: {}", e))),
        };
        let failed = item.is_err();
        if requests.send(item).await.is_err() || failed {
            break;
        }
    }
}
