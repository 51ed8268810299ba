//! In-process broker for tests and embedding.
//!
//! [`LoopbackBroker`] keeps subscriptions in memory and fans published
//! bodies out to every subscribed [`LoopbackTransport`] through unbounded
//! [`tokio::sync::mpsc`] channels. It follows the same private-destination
//! rule as `chatcache-broker`: `/user/{id}/...` may only be subscribed by
//! the client connected as `{id}`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatcache_proto::broker::{self, ReplyTo};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Delivery, Transport, TransportError, TransportType};

#[derive(Default)]
struct Hub {
    clients: HashMap<u64, mpsc::UnboundedSender<Delivery>>,
    subscriptions: HashMap<String, HashSet<u64>>,
    published: HashMap<String, usize>,
    next_conn: u64,
}

/// Shared in-memory broker. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new client named `client_id`.
    #[must_use]
    pub fn connect(&self, client_id: &str) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut hub = self.hub.lock();
            hub.next_conn += 1;
            let conn = hub.next_conn;
            hub.clients.insert(conn, tx);
            conn
        };
        LoopbackTransport {
            hub: Arc::clone(&self.hub),
            conn,
            client_id: client_id.to_string(),
            rx: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        }
    }

    /// Number of clients subscribed to `destination`.
    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.hub
            .lock()
            .subscriptions
            .get(destination)
            .map_or(0, HashSet::len)
    }

    /// Number of bodies published to `destination` so far.
    #[must_use]
    pub fn publish_count(&self, destination: &str) -> usize {
        self.hub
            .lock()
            .published
            .get(destination)
            .copied()
            .unwrap_or(0)
    }
}

/// One client connection to a [`LoopbackBroker`].
pub struct LoopbackTransport {
    hub: Arc<Mutex<Hub>>,
    conn: u64,
    client_id: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    connected: AtomicBool,
}

impl LoopbackTransport {
    /// Simulates losing (or regaining) the broker connection. While
    /// disconnected, publish and subscribe fail with
    /// [`TransportError::ConnectionClosed`]; existing subscriptions keep
    /// receiving.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// The name this client connected with.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }
}

impl Transport for LoopbackTransport {
    async fn publish(
        &self,
        destination: &str,
        reply_to: Option<ReplyTo>,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.check_connected()?;
        let mut hub = self.hub.lock();
        *hub.published.entry(destination.to_string()).or_default() += 1;
        let targets: Vec<u64> = hub
            .subscriptions
            .get(destination)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for conn in targets {
            if let Some(tx) = hub.clients.get(&conn) {
                let _ = tx.send(Delivery {
                    destination: destination.to_string(),
                    reply_to: reply_to.clone(),
                    body: body.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        if let Some(owner) = broker::user_destination_owner(destination)
            && owner != self.client_id
        {
            return Err(TransportError::Rejected(format!(
                "destination {destination} belongs to another user"
            )));
        }
        self.hub
            .lock()
            .subscriptions
            .entry(destination.to_string())
            .or_default()
            .insert(self.conn);
        Ok(())
    }

    async fn unsubscribe(&self, destination: &str) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        if let Some(conns) = hub.subscriptions.get_mut(destination) {
            conns.remove(&self.conn);
            if conns.is_empty() {
                hub.subscriptions.remove(destination);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut hub = self.hub.lock();
        hub.clients.remove(&self.conn);
        let conn = self.conn;
        hub.subscriptions.retain(|_, conns| {
            conns.remove(&conn);
            !conns.is_empty()
        });
    }
}
