//! Broker core: shared state, WebSocket handler, subscription registry and
//! fan-out.
//!
//! Each WebSocket connection identifies itself with a `Connect` frame and
//! then subscribes to destinations. A `Publish` is delivered to every
//! connection subscribed to its destination at the moment it is handled,
//! in the order frames arrive on the publishing connection. Nothing is
//! stored for later delivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chatcache_proto::broker::{self, ClientFrame, ReplyTo, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

/// Default maximum allowed body size in bytes (256 KB).
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// Per-connection limits enforced by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerLimits {
    /// Largest accepted publish body, in bytes.
    pub max_payload_size: usize,
    /// A connection that sends nothing for this long is closed. `None`
    /// keeps silent connections open.
    pub idle_timeout: Option<Duration>,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            idle_timeout: None,
        }
    }
}

/// Identifies one WebSocket connection. A user may hold several.
pub type ConnId = u64;

/// Reasons the broker rejects a client frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Subscribing to another user's private destination.
    #[error("destination {destination} belongs to another user")]
    Forbidden {
        /// The rejected destination.
        destination: String,
    },

    /// Publish body exceeds the configured limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Body size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The connection is not registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// A registered connection.
struct Connection {
    client_id: String,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared broker state: connections and destination subscriptions.
pub struct BrokerState {
    connections: RwLock<HashMap<ConnId, Connection>>,
    /// Destination → subscribed connections.
    subscriptions: RwLock<HashMap<String, HashSet<ConnId>>>,
    next_conn: AtomicU64,
    limits: BrokerLimits,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Creates an empty broker state with [`BrokerLimits::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(BrokerLimits::default())
    }

    /// Creates an empty broker state enforcing `limits`.
    #[must_use]
    pub fn with_limits(limits: BrokerLimits) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            limits,
        }
    }

    /// The limits this state enforces.
    #[must_use]
    pub const fn limits(&self) -> BrokerLimits {
        self.limits
    }

    /// Registers a connection for `client_id` and returns its id.
    pub async fn register(&self, client_id: &str, sender: mpsc::UnboundedSender<Message>) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(
            conn,
            Connection {
                client_id: client_id.to_string(),
                sender,
            },
        );
        conn
    }

    /// Removes a connection and all of its subscriptions.
    pub async fn unregister(&self, conn: ConnId) -> bool {
        let existed = self.connections.write().await.remove(&conn).is_some();
        let mut subs = self.subscriptions.write().await;
        subs.retain(|_, conns| {
            conns.remove(&conn);
            !conns.is_empty()
        });
        existed
    }

    /// Subscribes a connection to a destination.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] for another user's `/user/{id}/...`
    /// destination, [`BrokerError::UnknownConnection`] if `conn` is not
    /// registered.
    pub async fn subscribe(&self, conn: ConnId, destination: &str) -> Result<(), BrokerError> {
        let client_id = {
            let conns = self.connections.read().await;
            conns
                .get(&conn)
                .map(|c| c.client_id.clone())
                .ok_or(BrokerError::UnknownConnection(conn))?
        };
        if let Some(owner) = broker::user_destination_owner(destination)
            && owner != client_id
        {
            return Err(BrokerError::Forbidden {
                destination: destination.to_string(),
            });
        }
        self.subscriptions
            .write()
            .await
            .entry(destination.to_string())
            .or_default()
            .insert(conn);
        Ok(())
    }

    /// Removes a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, conn: ConnId, destination: &str) -> bool {
        let mut subs = self.subscriptions.write().await;
        let Some(conns) = subs.get_mut(destination) else {
            return false;
        };
        let removed = conns.remove(&conn);
        if conns.is_empty() {
            subs.remove(destination);
        }
        removed
    }

    /// Number of connections subscribed to `destination`.
    pub async fn subscriber_count(&self, destination: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(destination)
            .map_or(0, HashSet::len)
    }

    /// Delivers a body to every subscriber of `destination`. Returns the
    /// number of connections it was handed to.
    ///
    /// # Errors
    ///
    /// [`BrokerError::PayloadTooLarge`] if the body exceeds the limit.
    pub async fn publish(
        &self,
        destination: &str,
        reply_to: Option<ReplyTo>,
        body: Vec<u8>,
    ) -> Result<usize, BrokerError> {
        let max = self.limits.max_payload_size;
        if body.len() > max {
            return Err(BrokerError::PayloadTooLarge {
                size: body.len(),
                max,
            });
        }

        let targets: Vec<ConnId> = self
            .subscriptions
            .read()
            .await
            .get(destination)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if targets.is_empty() {
            tracing::debug!(destination = %destination, "publish with no subscribers");
            return Ok(0);
        }

        let frame = ServerFrame::Deliver {
            destination: destination.to_string(),
            reply_to,
            body,
        };
        let bytes = match broker::encode_server(&frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode deliver frame");
                return Ok(0);
            }
        };

        let conns = self.connections.read().await;
        let mut delivered = 0;
        for conn in targets {
            if let Some(c) = conns.get(&conn)
                && c.sender.send(Message::Binary(bytes.clone().into())).is_ok()
            {
                delivered += 1;
            }
        }
        tracing::debug!(destination = %destination, delivered, "published");
        Ok(delivered)
    }

    /// Send a WebSocket Close frame to every connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn, c) in conns.iter() {
            tracing::info!(conn, client_id = %c.client_id, "sending close frame");
            let _ = c.sender.send(Message::Close(None));
        }
    }

    async fn send_to(&self, conn: ConnId, frame: &ServerFrame) {
        let conns = self.connections.read().await;
        if let Some(c) = conns.get(&conn)
            && let Ok(bytes) = broker::encode_server(frame)
        {
            let _ = c.sender.send(Message::Binary(bytes.into()));
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// Lifecycle: wait for `Connect`, register and acknowledge, then process
/// frames until either side closes or the connection stays silent past the
/// idle timeout, then drop every subscription.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(client_id) = wait_for_connect(&mut ws_receiver).await else {
        tracing::warn!("connection closed before Connect");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = state.register(&client_id, tx).await;

    let ack = ServerFrame::Connected {
        client_id: client_id.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &ack).await {
        tracing::error!(client_id = %client_id, error = %e, "failed to send Connected ack");
        state.unregister(conn).await;
        return;
    }
    tracing::info!(client_id = %client_id, conn, "client connected");

    let writer_client = client_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client_id = %writer_client, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let idle_timeout = state.limits.idle_timeout;
    let reader_client = client_id.clone();
    let mut read_task = tokio::spawn(async move {
        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(client_id = %reader_client, conn, ?limit, "idle connection closed");
                        break;
                    }
                },
                None => ws_receiver.next().await,
            };
            let Some(Ok(msg)) = next else { break };
            match msg {
                Message::Binary(data) => handle_frame(conn, &data, &reader_state).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(conn).await;
    tracing::info!(client_id = %client_id, conn, "client disconnected");
}

/// Waits for the `Connect` frame. Returns the client id, or `None` if the
/// connection closes or sends anything else first.
async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match broker::decode_client(&data) {
                Ok(ClientFrame::Connect { client_id }) if !client_id.is_empty() => {
                    return Some(client_id);
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected Connect");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode Connect frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_frame(conn: ConnId, data: &[u8], state: &Arc<BrokerState>) {
    let frame = match broker::decode_client(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(conn, error = %e, "failed to decode frame");
            return;
        }
    };

    let result = match frame {
        ClientFrame::Subscribe { destination } => {
            tracing::debug!(conn, destination = %destination, "subscribe");
            state.subscribe(conn, &destination).await
        }
        ClientFrame::Unsubscribe { destination } => {
            state.unsubscribe(conn, &destination).await;
            Ok(())
        }
        ClientFrame::Publish {
            destination,
            reply_to,
            body,
        } => state
            .publish(&destination, reply_to, body)
            .await
            .map(|_| ()),
        ClientFrame::Heartbeat => {
            state.send_to(conn, &ServerFrame::HeartbeatAck).await;
            Ok(())
        }
        ClientFrame::Connect { client_id } => {
            tracing::warn!(conn, client_id = %client_id, "duplicate Connect ignored");
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::warn!(conn, error = %e, "frame rejected");
        let reason = e.to_string();
        state.send_to(conn, &ServerFrame::Error { reason }).await;
    }
}

async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let bytes = broker::encode_server(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the broker on `addr` with default state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BrokerState::new())).await
}

/// Starts the broker with a pre-built [`BrokerState`], returning the bound
/// address and the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BrokerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
