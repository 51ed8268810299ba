//! Glue between a [`Transport`] and the [`Router`].
//!
//! A [`Channel`] owns the transport-level subscriptions and runs the pump
//! task that decodes every delivery as JSON and hands it to the router.
//! Router registrations come and go per call; transport subscriptions for
//! shared destinations stay in place for the life of the connection, and
//! per-request destinations are released when their call ends.

use std::collections::HashSet;
use std::sync::Arc;

use chatcache_proto::broker::ReplyTo;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Transport, TransportError};
use crate::router::Router;

/// A transport plus the router fed from it.
pub struct Channel<T: Transport> {
    transport: Arc<T>,
    router: Arc<Router>,
    subscribed: Mutex<HashSet<String>>,
}

impl<T: Transport> Channel<T> {
    /// Wraps `transport`, routing deliveries into `router`.
    pub fn new(transport: Arc<T>, router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            router,
            subscribed: Mutex::new(HashSet::new()),
        })
    }

    /// The router deliveries are dispatched to.
    #[must_use]
    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Subscribes the transport to `destination` unless already subscribed.
    ///
    /// The destination is claimed before the subscribe frame is sent, so
    /// concurrent callers send it once. The claim is dropped if sending fails.
    ///
    /// # Errors
    ///
    /// Propagates the transport's subscribe error.
    pub async fn ensure_subscribed(&self, destination: &str) -> Result<(), TransportError> {
        if !self.subscribed.lock().insert(destination.to_string()) {
            return Ok(());
        }
        if let Err(e) = self.transport.subscribe(destination).await {
            self.subscribed.lock().remove(destination);
            return Err(e);
        }
        Ok(())
    }

    /// Drops the transport subscription for a destination that will not be
    /// used again. The unsubscribe frame is sent from a background task.
    pub fn release(&self, destination: &str) {
        if !self.subscribed.lock().remove(destination) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let destination = destination.to_string();
        handle.spawn(async move {
            if let Err(e) = transport.unsubscribe(&destination).await {
                tracing::debug!(destination = %destination, error = %e, "unsubscribe failed");
            }
        });
    }

    /// Serializes `payload` as JSON and publishes it.
    ///
    /// # Errors
    ///
    /// Returns the transport's publish error.
    pub async fn publish_json(
        &self,
        destination: &str,
        reply_to: Option<ReplyTo>,
        payload: &Value,
    ) -> Result<(), TransportError> {
        let body = serde_json::to_vec(payload).map_err(|e| TransportError::Io(e.into()))?;
        self.transport.publish(destination, reply_to, body).await
    }

    /// Spawns the pump: receives deliveries until the transport closes and
    /// dispatches each one through the router.
    pub fn spawn_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.transport.recv().await {
                    Ok(delivery) => {
                        let payload = match serde_json::from_slice::<Value>(&delivery.body) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(
                                    destination = %delivery.destination,
                                    error = %e,
                                    "dropping non-JSON delivery"
                                );
                                continue;
                            }
                        };
                        this.router.deliver(&delivery.destination, &payload);
                    }
                    Err(e) => {
                        tracing::info!(error = %e, "transport closed, pump exiting");
                        break;
                    }
                }
            }
        })
    }
}
