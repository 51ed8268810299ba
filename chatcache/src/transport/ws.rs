//! WebSocket transport to a `chatcache-broker`.
//!
//! [`WsTransport::connect`] performs the `Connect` handshake and hands the
//! socket to a supervisor task. The supervisor multiplexes outgoing frames,
//! incoming deliveries and a heartbeat. When the connection drops it
//! reconnects with a linear backoff, replays the current subscriptions, and
//! keeps feeding the same delivery channel, so callers of
//! [`Transport::recv`] only see an error once reconnection is abandoned.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatcache_proto::broker::{self, ClientFrame, ReplyTo, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Delivery, Transport, TransportError, TransportType};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Reconnect schedule: attempt `n` waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay unit.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Connection parameters for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Timeout for the TCP/WebSocket connect.
    pub connect_timeout: Duration,
    /// Timeout for the `Connected` acknowledgment.
    pub handshake_timeout: Duration,
    /// Interval between heartbeats. A connection that stays silent for two
    /// intervals is treated as lost.
    pub heartbeat_interval: Duration,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the incoming delivery channel.
    pub channel_capacity: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            channel_capacity: 256,
        }
    }
}

/// WebSocket transport implementing [`Transport`].
pub struct WsTransport {
    client_id: String,
    url: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    connected: Arc<AtomicBool>,
    _supervisor: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connects to the broker at `url` as `client_id`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if connecting or the handshake times out.
    /// - [`TransportError::ConnectionClosed`] if the broker closes during the handshake.
    /// - [`TransportError::Rejected`] if the broker answers with an error.
    /// - [`TransportError::Io`] for socket failures.
    pub async fn connect(
        url: &str,
        client_id: &str,
        options: WsOptions,
    ) -> Result<Self, TransportError> {
        let (sink, reader) = handshake(url, client_id, &options).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(options.channel_capacity);
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let supervisor = Supervisor {
            url: url.to_string(),
            client_id: client_id.to_string(),
            options,
            outbound: outbound_rx,
            incoming: incoming_tx,
            subscriptions: Arc::clone(&subscriptions),
            connected: Arc::clone(&connected),
        };
        let handle = tokio::spawn(supervisor.run(sink, reader));

        Ok(Self {
            client_id: client_id.to_string(),
            url: url.to_string(),
            outbound: outbound_tx,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            subscriptions,
            connected,
            _supervisor: handle,
        })
    }

    /// The broker URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The id this client connected as.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn enqueue(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl Transport for WsTransport {
    async fn publish(
        &self,
        destination: &str,
        reply_to: Option<ReplyTo>,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        self.enqueue(ClientFrame::Publish {
            destination: destination.to_string(),
            reply_to,
            body,
        })
    }

    async fn subscribe(&self, destination: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().insert(destination.to_string());
        self.enqueue(ClientFrame::Subscribe {
            destination: destination.to_string(),
        })
    }

    async fn unsubscribe(&self, destination: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().remove(destination);
        self.enqueue(ClientFrame::Unsubscribe {
            destination: destination.to_string(),
        })
    }

    async fn recv(&self) -> Result<Delivery, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Why a connection loop ended.
enum Exit {
    /// The transport was dropped or the consumer went away.
    Shutdown,
    /// The socket failed; try to reconnect.
    Lost,
}

struct Supervisor {
    url: String,
    client_id: String,
    options: WsOptions,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    incoming: mpsc::Sender<Delivery>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    connected: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(mut self, mut sink: WsSender, mut reader: WsReader) {
        loop {
            let exit = self.serve(&mut sink, &mut reader).await;
            self.connected.store(false, Ordering::Relaxed);
            if matches!(exit, Exit::Shutdown) {
                break;
            }
            tracing::warn!(url = %self.url, "broker connection lost");
            let Some((s, r)) = self.reconnect().await else {
                tracing::error!(url = %self.url, "giving up on broker connection");
                break;
            };
            sink = s;
            reader = r;
        }
        tracing::info!("broker supervisor exiting");
    }

    async fn serve(&mut self, sink: &mut WsSender, reader: &mut WsReader) -> Exit {
        let interval = self.options.heartbeat_interval;
        let mut heartbeat = tokio::time::interval(interval);
        heartbeat.tick().await;
        let mut last_seen = tokio::time::Instant::now();

        loop {
            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.close().await;
                        return Exit::Shutdown;
                    };
                    if let Err(e) = send_frame(sink, &frame).await {
                        tracing::warn!(error = %e, "broker send failed");
                        return Exit::Lost;
                    }
                }
                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = tokio::time::Instant::now();
                            if !self.dispatch(&data).await {
                                return Exit::Shutdown;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "broker read error");
                            return Exit::Lost;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > interval * 2 {
                        tracing::warn!("broker heartbeat missed");
                        return Exit::Lost;
                    }
                    if send_frame(sink, &ClientFrame::Heartbeat).await.is_err() {
                        return Exit::Lost;
                    }
                }
            }
        }
    }

    /// Handles one server frame. Returns `false` once nobody is receiving.
    async fn dispatch(&self, data: &[u8]) -> bool {
        match broker::decode_server(data) {
            Ok(ServerFrame::Deliver {
                destination,
                reply_to,
                body,
            }) => {
                let delivery = Delivery {
                    destination,
                    reply_to,
                    body,
                };
                return self.incoming.send(delivery).await.is_ok();
            }
            Ok(ServerFrame::Error { reason }) => {
                tracing::warn!(reason = %reason, "broker error");
            }
            Ok(ServerFrame::HeartbeatAck | ServerFrame::Connected { .. }) => {}
            Err(e) => {
                tracing::warn!(error = %e, "malformed broker frame, skipping");
            }
        }
        true
    }

    async fn reconnect(&self) -> Option<(WsSender, WsReader)> {
        let policy = self.options.reconnect;
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
            tracing::info!(attempt, url = %self.url, "reconnecting to broker");
            match handshake(&self.url, &self.client_id, &self.options).await {
                Ok((mut sink, reader)) => {
                    let destinations: Vec<String> =
                        self.subscriptions.lock().iter().cloned().collect();
                    for destination in destinations {
                        if send_frame(&mut sink, &ClientFrame::Subscribe { destination })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    self.connected.store(true, Ordering::Relaxed);
                    tracing::info!(attempt, "reconnected to broker");
                    return Some((sink, reader));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        None
    }
}

async fn send_frame(sink: &mut WsSender, frame: &ClientFrame) -> Result<(), TransportError> {
    let bytes = broker::encode_client(frame)?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))
}

/// Opens the socket, sends `Connect` and waits for `Connected`.
async fn handshake(
    url: &str,
    client_id: &str,
    options: &WsOptions,
) -> Result<(WsSender, WsReader), TransportError> {
    let (ws_stream, _response) = tokio::time::timeout(options.connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            tracing::warn!(url, "broker connect timed out");
            TransportError::Timeout
        })?
        .map_err(|e| {
            tracing::warn!(url, error = %e, "broker connect failed");
            TransportError::Io(std::io::Error::other(e))
        })?;

    let (mut sink, mut reader) = ws_stream.split();
    send_frame(
        &mut sink,
        &ClientFrame::Connect {
            client_id: client_id.to_string(),
        },
    )
    .await?;

    let ack = tokio::time::timeout(options.handshake_timeout, reader.next())
        .await
        .map_err(|_| TransportError::Timeout)?;

    match ack {
        Some(Ok(Message::Binary(data))) => match broker::decode_server(&data)? {
            ServerFrame::Connected { client_id: acked } => {
                tracing::info!(client_id = %acked, url, "connected to broker");
                Ok((sink, reader))
            }
            ServerFrame::Error { reason } => Err(TransportError::Rejected(reason)),
            other => {
                tracing::warn!(?other, "unexpected frame during handshake");
                Err(TransportError::Rejected(
                    "unexpected frame during handshake".to_string(),
                ))
            }
        },
        Some(Ok(Message::Close(_))) | None => Err(TransportError::ConnectionClosed),
        Some(Ok(_)) => Err(TransportError::Rejected(
            "unexpected non-binary frame during handshake".to_string(),
        )),
        Some(Err(e)) => Err(TransportError::Io(std::io::Error::other(e))),
    }
}
