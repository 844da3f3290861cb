//! # JSON-RPC over TCP
//!
//! [`TcpConnector`] opens the socket; [`TcpRpcChannel`] runs it.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         TcpRpcChannel                                   │
//! │                                                                         │
//! │  invoke() ──► outgoing mpsc ──┐                                         │
//! │    │                          ▼                                         │
//! │    │ oneshot            ┌──────────────┐  socket   ┌──────────────┐   │
//! │    └────────────────────│   io task    │◄─────────►│  TLC facility│   │
//! │       (by request id)   │ select! over │           └──────────────┘   │
//! │                         │ read/write/  │                              │
//! │                         │ shutdown     │                              │
//! │                         └──────┬───────┘                              │
//! │                                │ inbound requests (in order)           │
//! │                         ┌──────▼───────┐                              │
//! │                         │ dispatcher   │──► RpcHandler::handle         │
//! │                         │ task         │──► reply via outgoing mpsc    │
//! │                         └──────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound requests are handled one at a time, so the facility's updates are
//! applied in the order it sent them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelScope;
use crate::error::{ClientError, ClientResult};
use crate::framing::BraceFramer;
use crate::protocol::{decode_frame, Incoming, RpcRequest, RpcResponse};
use crate::rpc::{Connector, RpcChannel, RpcHandler};

const OUTGOING_CAPACITY: usize = 64;
const READ_BUFFER: usize = 8 * 1024;

type PendingMap = HashMap<u64, oneshot::Sender<RpcResponse>>;

// =============================================================================
// Connector
// =============================================================================

/// Opens plain TCP connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
        handler: Arc<dyn RpcHandler>,
    ) -> ClientResult<Arc<dyn RpcChannel>> {
        debug!(address, timeout_ms = timeout.as_millis() as u64, "Connecting");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", address, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Could not disable Nagle");
        }
        info!(address, "Connected");
        Ok(TcpRpcChannel::spawn(stream, handler))
    }
}

// =============================================================================
// Channel
// =============================================================================

pub struct TcpRpcChannel {
    outgoing: mpsc::Sender<String>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
    shutdown: CancelScope,
}

impl TcpRpcChannel {
    /// Starts the io and dispatcher tasks on any byte stream.
    pub fn spawn<S>(stream: S, handler: Arc<dyn RpcHandler>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancelScope::new();

        let io = IoTask {
            pending: pending.clone(),
            connected: connected.clone(),
            closed: closed_tx,
            requests: requests_tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(io.run(reader, writer, outgoing_rx));
        tokio::spawn(dispatch_requests(requests_rx, handler, outgoing_tx.clone()));

        Arc::new(TcpRpcChannel {
            outgoing: outgoing_tx,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            closed: closed_rx,
            shutdown,
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingMap> {
        lock(&self.pending)
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl RpcChannel for TcpRpcChannel {
    async fn invoke(&self, method: &str, params: Value, timeout: Duration) -> ClientResult<Value> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&RpcRequest::call(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        if self.outgoing.send(text).await.is_err() {
            self.lock_pending().remove(&id);
            return Err(ClientError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(ClientError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.wait_closed().await;
    }
}

impl Drop for TcpRpcChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Tasks
// =============================================================================

struct IoTask {
    pending: Arc<Mutex<PendingMap>>,
    connected: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
    requests: mpsc::UnboundedSender<RpcRequest>,
    shutdown: CancelScope,
}

impl IoTask {
    async fn run<R, W>(self, mut reader: R, mut writer: W, mut outgoing: mpsc::Receiver<String>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut framer = BraceFramer::new();
        let mut buf = vec![0u8; READ_BUFFER];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Channel shut down locally");
                    break;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("Connection closed by remote");
                        break;
                    }
                    Ok(n) => match framer.push(&buf[..n]) {
                        Ok(frames) => frames.iter().for_each(|frame| self.route(frame)),
                        Err(e) => {
                            error!(error = %e, "Dropping connection");
                            break;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Socket read failed");
                        break;
                    }
                },
                message = outgoing.recv() => match message {
                    Some(text) => {
                        if let Err(e) = writer.write_all(text.as_bytes()).await {
                            warn!(error = %e, "Socket write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every waiting invoke() with Disconnected.
        lock(&self.pending).clear();
        let _ = writer.shutdown().await;
        self.closed.send_replace(true);
    }

    fn route(&self, frame: &str) {
        match decode_frame(frame) {
            Ok(Incoming::Request(request)) => {
                if self.requests.send(request).is_err() {
                    warn!("Request dispatcher is gone");
                }
            }
            Ok(Incoming::Response(response)) => {
                let waiter = response
                    .request_id()
                    .and_then(|id| lock(&self.pending).remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = %response.id, "Response for unknown or expired request"),
                }
            }
            Err(e) => warn!(error = %e, "Ignoring undecodable frame"),
        }
    }
}

async fn dispatch_requests(
    mut requests: mpsc::UnboundedReceiver<RpcRequest>,
    handler: Arc<dyn RpcHandler>,
    outgoing: mpsc::Sender<String>,
) {
    while let Some(request) = requests.recv().await {
        let notification = request.is_notification();
        let reply = handler.handle(&request.method, request.params).await;

        if notification {
            continue;
        }
        let id = request.id.unwrap_or(Value::Null);
        let response = match reply {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        };
        match serde_json::to_string(&response) {
            Ok(text) => {
                if outgoing.send(text).await.is_err() {
                    break;
                }
            }
            Err(e) => error!(error = %e, "Could not encode reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcErrorObject;
    use serde_json::json;
    use tokio::io::DuplexStream;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
            match method {
                "Alive" => Ok(params),
                other => Err(RpcErrorObject::method_not_found(other)),
            }
        }
    }

    async fn read_frame(stream: &mut DuplexStream, framer: &mut BraceFramer) -> Value {
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            if let Some(frame) = framer.push(&buf[..n]).unwrap().into_iter().next() {
                return serde_json::from_str(&frame).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_invoke_matches_response() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let channel = TcpRpcChannel::spawn(local, Arc::new(EchoHandler));

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .invoke("Alive", json!({ "ticks": 1, "time": 2 }), Duration::from_secs(5))
                    .await
            })
        };

        let mut framer = BraceFramer::new();
        let request = read_frame(&mut remote, &mut framer).await;
        assert_eq!(request["method"], "Alive");
        let reply = json!({ "jsonrpc": "2.0", "result": request["params"], "id": request["id"] });
        remote.write_all(reply.to_string().as_bytes()).await.unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({ "ticks": 1, "time": 2 }));
    }

    #[tokio::test]
    async fn test_inbound_request_is_answered() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let _channel = TcpRpcChannel::spawn(local, Arc::new(EchoHandler));

        let request = r#"{"jsonrpc":"2.0","method":"Alive","params":{"ticks":3,"time":4},"id":"x1"}"#;
        remote.write_all(request.as_bytes()).await.unwrap();

        let mut framer = BraceFramer::new();
        let reply = read_frame(&mut remote, &mut framer).await;
        assert_eq!(reply["id"], "x1");
        assert_eq!(reply["result"], json!({ "ticks": 3, "time": 4 }));

        let unknown = r#"{"jsonrpc":"2.0","method":"Bogus","params":{},"id":2}"#;
        remote.write_all(unknown.as_bytes()).await.unwrap();
        let reply = read_frame(&mut remote, &mut framer).await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_times_out() {
        let (local, _remote) = tokio::io::duplex(4096);
        let channel = TcpRpcChannel::spawn(local, Arc::new(EchoHandler));

        let err = channel
            .invoke("Alive", json!({}), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(500)));
        assert!(channel.lock_pending().is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_is_observed() {
        let (local, remote) = tokio::io::duplex(4096);
        let channel = TcpRpcChannel::spawn(local, Arc::new(EchoHandler));
        assert!(channel.is_connected());

        drop(remote);
        channel.wait_closed().await;
        assert!(!channel.is_connected());

        let err = channel
            .invoke("Alive", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_local_close() {
        let (local, _remote) = tokio::io::duplex(4096);
        let channel = TcpRpcChannel::spawn(local, Arc::new(EchoHandler));
        channel.close().await;
        assert!(!channel.is_connected());
    }
}
