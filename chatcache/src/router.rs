//! Destination router.
//!
//! Maps destination names to the handlers currently waiting on them and
//! invokes every handler registered for a destination when a payload for it
//! arrives. One-shot handlers (correlated calls) and long-lived handlers
//! (stream sessions, live updates) share the same namespace, so a handler
//! that fails must never keep the others from running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

/// Error returned by a handler. Logged by the router, never propagated.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Creates a handler error from any displayable reason.
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// Handle returned by [`Router::subscribe`], used to remove exactly that
/// registration again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Value) -> Result<(), HandlerError> + Send + Sync>;

/// Routes delivered payloads to registered handlers.
#[derive(Default)]
pub struct Router {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl Router {
    /// Creates a router with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `destination`. Handlers for one destination
    /// run in registration order.
    pub fn subscribe<F>(&self, destination: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(destination.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        tracing::trace!(destination = %destination, handler = id.0, "handler registered");
        id
    }

    /// Removes one registration. Returns `false` if it was not present.
    pub fn unsubscribe(&self, destination: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(destination) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(destination);
        }
        removed
    }

    /// Invokes every handler registered for `destination` with `payload`.
    ///
    /// Handlers are called outside the registry lock, so a handler may
    /// subscribe or unsubscribe. Returns the number of handlers invoked.
    pub fn deliver(&self, destination: &str, payload: &Value) -> usize {
        let snapshot: Vec<(HandlerId, Handler)> = self
            .handlers
            .lock()
            .get(destination)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            tracing::debug!(destination = %destination, "delivery with no handlers");
        }

        for (id, handler) in &snapshot {
            if let Err(e) = handler(payload) {
                tracing::warn!(
                    destination = %destination,
                    handler = id.0,
                    error = %e,
                    "handler failed"
                );
            }
        }
        snapshot.len()
    }

    /// Number of handlers registered for `destination`.
    #[must_use]
    pub fn handler_count(&self, destination: &str) -> usize {
        self.handlers.lock().get(destination).map_or(0, Vec::len)
    }
}
