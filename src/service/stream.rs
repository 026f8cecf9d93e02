use tokio::sync::mpsc;

use crate::errors::DispatchError;

/// Server half of a bidirectional message stream.
///
/// `incoming` yields `None` once the peer closes its sending side. An `Err`
/// item is a transport failure other than a clean close.
pub struct ServerStream<Req, Resp> {
    pub incoming: mpsc::Receiver<Result<Req, DispatchError>>,
    pub outgoing: mpsc::Sender<Resp>,
}

/// Peer half of a [`ServerStream`]. Dropping `requests` is a clean close.
pub struct ClientStream<Req, Resp> {
    pub requests: mpsc::Sender<Result<Req, DispatchError>>,
    pub responses: mpsc::Receiver<Resp>,
}

/// Create a connected server/client pair with `buffer` slots per direction.
pub fn pair<Req, Resp>(buffer: usize) -> (ServerStream<Req, Resp>, ClientStream<Req, Resp>) {
    let (req_tx, req_rx) = mpsc::channel(buffer);
    let (resp_tx, resp_rx) = mpsc::channel(buffer);
    (
        ServerStream {
            incoming: req_rx,
            outgoing: resp_tx,
        },
        ClientStream {
            requests: req_tx,
            responses: resp_rx,
        },
    )
}

/// Receive the next message. `Ok(None)` means end of stream.
pub async fn recv<Req>(
    incoming: &mut mpsc::Receiver<Result<Req, DispatchError>>,
) -> Result<Option<Req>, DispatchError> {
    incoming.recv().await.transpose()
}

pub async fn send<Resp>(outgoing: &mpsc::Sender<Resp>, msg: Resp) -> Result<(), DispatchError> {
    outgoing
        .send(msg)
        .await
        .map_err(|_| DispatchError::Canceled("stream closed by peer".to_string()))
}

impl<Req, Resp> ClientStream<Req, Resp> {
    pub async fn send(&self, req: Req) -> Result<(), DispatchError> {
        self.requests
            .send(Ok(req))
            .await
            .map_err(|_| DispatchError::Canceled("stream closed by server".to_string()))
    }

    pub async fn recv(&mut self) -> Option<Resp> {
        self.responses.recv().await
    }
}
