//! Bidirectional JSON-RPC peer over any async byte stream
//!
//! A background reader routes responses to waiting callers and dispatches
//! inbound requests and notifications to an [`RpcHandler`]. When the stream
//! ends, every pending call resolves to [`RpcError::Disconnected`].
//!
//! Notifications a handler assigns to a lane run on that lane's own task, in
//! arrival order. The reader never waits on them, so a laned notification
//! may itself make blocking calls over the same link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::protocol::{Incoming, RpcMessage};
use super::RpcError;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;
type Lanes = HashMap<String, mpsc::UnboundedSender<(String, Value)>>;

/// Serves the methods one side exposes to the other
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle a request that expects a reply. Requests run concurrently.
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Handle a notification. Unlaned notifications run on the reader one at
    /// a time, so those must not block for long.
    async fn handle_notification(&self, method: &str, params: Value);

    /// Ordered queue for a notification; `None` handles it on the reader
    fn notification_lane(&self, _method: &str, _params: &Value) -> Option<String> {
        None
    }
}

pub struct RpcPeer {
    name: String,
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl RpcPeer {
    /// Create a peer that writes to `writer`. Nothing is read until
    /// [`RpcPeer::serve`] is called.
    pub fn connect<W>(name: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            name: name.into(),
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            peer.name.clone(),
            writer,
            rx,
            peer.closed.clone(),
            Arc::clone(&peer.pending),
        ));
        peer
    }

    /// Start the background reader
    pub fn serve<R>(self: &Arc<Self>, reader: R, handler: Arc<dyn RpcHandler>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut lanes = Lanes::new();
            loop {
                let line = tokio::select! {
                    _ = peer.closed.cancelled() => break,
                    line = lines.next_line() => line,
                };

                match line {
                    Ok(Some(line)) => peer.dispatch(&line, &handler, &mut lanes).await,
                    Ok(None) => {
                        debug!("{}: stream closed", peer.name);
                        break;
                    }
                    Err(e) => {
                        error!("{}: read error: {}", peer.name, e);
                        break;
                    }
                }
            }
            peer.shutdown();
        })
    }

    async fn dispatch(self: &Arc<Self>, line: &str, handler: &Arc<dyn RpcHandler>, lanes: &mut Lanes) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if !line.starts_with('{') {
            debug!("{}: skipping non-JSON line: {}", self.name, line);
            return;
        }

        let message = match serde_json::from_str::<RpcMessage>(line).map(RpcMessage::classify) {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                warn!("{}: {}", self.name, e);
                return;
            }
            Err(e) => {
                warn!("{}: unparseable message: {}", self.name, e);
                return;
            }
        };

        match message {
            Incoming::Response { id, result } => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("{}: response for unknown request {}", self.name, id),
                }
            }
            Incoming::Request { id, method, params } => {
                let peer = Arc::clone(self);
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    let reply = match handler.handle_request(&method, params).await {
                        Ok(result) => RpcMessage::response(id, result),
                        Err(e) => {
                            debug!("{}: {} failed: {}", peer.name, method, e);
                            RpcMessage::error_response(id, &e)
                        }
                    };
                    if let Err(e) = peer.send_message(&reply) {
                        debug!("{}: could not reply to {}: {}", peer.name, method, e);
                    }
                });
            }
            Incoming::Notification { method, params } => {
                match handler.notification_lane(&method, &params) {
                    Some(lane) => self.enqueue(lanes, lane, handler, method, params),
                    None => handler.handle_notification(&method, params).await,
                }
            }
        }
    }

    fn enqueue(
        &self,
        lanes: &mut Lanes,
        lane: String,
        handler: &Arc<dyn RpcHandler>,
        method: String,
        params: Value,
    ) {
        let tx = lanes.entry(lane).or_insert_with_key(|lane| {
            debug!("{}: opening notification lane {:?}", self.name, lane);
            spawn_lane(Arc::clone(handler))
        });
        if let Err(mpsc::error::SendError((method, _))) = tx.send((method, params)) {
            warn!("{}: notification lane gone, dropped {}", self.name, method);
        }
    }

    /// Blocking call: waits until the other side replies or the link drops
    pub async fn call<P, T>(&self, method: &str, params: P) -> Result<T, RpcError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        // A shutdown that raced the insert above has already drained the map
        if self.closed.is_cancelled() {
            self.pending.lock().remove(&id);
            return Err(RpcError::Disconnected);
        }

        if let Err(e) = self.send_message(&RpcMessage::request(id, method, params)) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let value = rx.await.map_err(|_| RpcError::Disconnected)??;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Malformed(format!("bad result for {}: {}", method, e)))
    }

    /// Fire-and-forget
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        let params = serde_json::to_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))?;
        self.send_message(&RpcMessage::notification(method, params))
    }

    fn send_message(&self, message: &RpcMessage) -> Result<(), RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::Disconnected);
        }
        let line = serde_json::to_string(message).map_err(|e| RpcError::Malformed(e.to_string()))?;
        self.outbound
            .send(line)
            .map_err(|_| RpcError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link is down
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Tear the link down and fail every in-flight call
    pub fn shutdown(&self) {
        self.closed.cancel();
        fail_pending(&self.pending);
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Task that handles one lane's notifications in order until the reader stops
fn spawn_lane(handler: Arc<dyn RpcHandler>) -> mpsc::UnboundedSender<(String, Value)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
    tokio::spawn(async move {
        while let Some((method, params)) = rx.recv().await {
            handler.handle_notification(&method, params).await;
        }
    });
    tx
}

fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(RpcError::Disconnected));
    }
}

async fn write_loop<W>(
    name: String,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
    pending: PendingMap,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            error!("{}: write error: {}", name, e);
            break;
        }
    }
    closed.cancel();
    fail_pending(&pending);
    let _ = writer.shutdown().await;
}
