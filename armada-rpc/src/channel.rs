//! Persistent-channel transport: one WebSocket per service.
//!
//! Calls are multiplexed over the socket and matched to their callers by
//! correlation id. A reader task owns the receive half; a writer task owns
//! the send half and drains an unbounded queue. When the socket closes, every
//! pending call fails with `Disconnected` and the next call reconnects.

use armada_core::{
    RpcError, RpcId, RpcRequest, RpcResponse, RpcResult, ServiceDescriptor, TransportError,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

type PendingMap = DashMap<RpcId, oneshot::Sender<RpcResponse>>;

/// One live socket to one service.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        self.pending.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a pending entry when the call future completes or is dropped.
/// Remote work is not cancelled; a late response is simply unmatched.
struct PendingGuard {
    pending: Arc<PendingMap>,
    id: RpcId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// WebSocket transport with lazy connect and reconnect-on-next-call.
pub struct ChannelTransport {
    connections: DashMap<String, Arc<Connection>>,
    /// Serializes connection attempts per service only.
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    next_id: AtomicU64,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> RpcResult<serde_json::Value> {
        let service = descriptor.name.as_str();
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || -> RpcError {
            TransportError::Timeout {
                service: service.to_string(),
                method: method.to_string(),
                timeout,
            }
            .into()
        };

        let connection = tokio::time::timeout_at(deadline, self.connection(descriptor))
            .await
            .map_err(|_| timed_out())??;

        let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        connection.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&connection.pending),
            id: id.clone(),
        };

        // The reader marks the connection closed before draining, so a call
        // registered after the drain sees the flag here.
        if connection.is_closed() {
            return Err(disconnected(service));
        }

        let request = RpcRequest::new(id, method, params);
        let text = serde_json::to_string(&request).map_err(|e| TransportError::SendFailed {
            service: service.to_string(),
            reason: e.to_string(),
        })?;
        connection
            .outbound
            .send(Message::Text(text))
            .map_err(|_| disconnected(service))?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => response.into_result(service, method),
            Ok(Err(_)) => Err(disconnected(service)),
            Err(_) => Err(timed_out()),
        }
    }

    /// Number of calls awaiting a response on `service`'s socket.
    pub fn pending_calls(&self, service: &str) -> usize {
        self.connections
            .get(service)
            .map(|conn| conn.pending.len())
            .unwrap_or(0)
    }

    /// Whether a live socket to `service` is currently held.
    pub fn is_connected(&self, service: &str) -> bool {
        self.connections
            .get(service)
            .map(|conn| !conn.is_closed())
            .unwrap_or(false)
    }

    /// Drop every socket. Pending calls fail with `Disconnected`.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().shutdown();
        }
        self.connections.clear();
    }

    async fn connection(&self, descriptor: &ServiceDescriptor) -> RpcResult<Arc<Connection>> {
        if let Some(conn) = self.live_connection(&descriptor.name) {
            return Ok(conn);
        }

        let lock = Arc::clone(
            self.connect_locks
                .entry(descriptor.name.clone())
                .or_default()
                .value(),
        );
        let _lock = lock.lock().await;
        if let Some(conn) = self.live_connection(&descriptor.name) {
            return Ok(conn);
        }

        let conn = Arc::new(open(descriptor).await?);
        self.connections
            .insert(descriptor.name.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    fn live_connection(&self, service: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(service)
            .filter(|conn| !conn.is_closed())
            .map(|conn| Arc::clone(conn.value()))
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("connections", &self.connections.len())
            .finish()
    }
}

fn disconnected(service: &str) -> RpcError {
    TransportError::Disconnected {
        service: service.to_string(),
    }
    .into()
}

async fn open(descriptor: &ServiceDescriptor) -> RpcResult<Connection> {
    let service = descriptor.name.clone();
    let (socket, _) = tokio_tungstenite::connect_async(descriptor.endpoint.as_str())
        .await
        .map_err(|e| TransportError::ConnectFailed {
            service: service.clone(),
            reason: e.to_string(),
        })?;
    debug!(service = %service, endpoint = %descriptor.endpoint, "Channel connected");

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
    let pending: Arc<PendingMap> = Arc::new(DashMap::new());
    let closed = Arc::new(AtomicBool::new(false));

    let writer_service = service.clone();
    tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!(service = %writer_service, error = %e, "Channel write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_pending = Arc::clone(&pending);
    let reader_closed = Arc::clone(&closed);
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => dispatch(&service, &reader_pending, &text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(service = %service, error = %e, "Channel read failed");
                    break;
                }
            }
        }
        reader_closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a receive error.
        reader_pending.clear();
        debug!(service = %service, "Channel closed");
    });

    Ok(Connection {
        outbound,
        pending,
        closed,
        reader,
    })
}

fn dispatch(service: &str, pending: &PendingMap, text: &str) {
    let response = match RpcResponse::parse(service, text) {
        Ok(response) => response,
        Err(e) => {
            warn!(service = %service, error = %e, "Dropping malformed channel message");
            return;
        }
    };

    match pending.remove(&response.id) {
        Some((_, waiter)) => {
            let _ = waiter.send(response);
        }
        None => {
            warn!(service = %service, id = %response.id, "Dropping response with unmatched id");
        }
    }
}
