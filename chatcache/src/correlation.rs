//! Request/response over publish/subscribe.
//!
//! The broker only moves bodies between destinations. A call is emulated by
//! registering handlers on a success and an error destination, publishing
//! the request with those destinations as its `reply_to`, and waiting for
//! whichever of success, error or timeout happens first.
//!
//! Every call owns a [`CallGuard`]. Dropping it removes both router
//! handlers, so teardown happens exactly once whether the call succeeds,
//! fails, times out, fails to publish, or is cancelled by dropping the
//! future.

use std::sync::Arc;
use std::time::Duration;

use chatcache_proto::broker::ReplyTo;
use chatcache_proto::message::UserId;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::normalize;
use crate::router::HandlerId;
use crate::transport::channel::Channel;
use crate::transport::{Transport, TransportError};

/// Errors from a correlated call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Subscribing or publishing failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote side answered on the error destination.
    #[error("remote error: {message}")]
    Remote {
        /// Message extracted from the error payload.
        message: String,
    },

    /// No answer arrived in time.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The completion channel was dropped without an answer.
    #[error("call closed without a response")]
    Closed,
}

/// Where a call's answer is expected and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// Destination the success payload is published to.
    pub success_destination: String,
    /// Destination the error payload is published to.
    pub error_destination: String,
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    /// Whether the destinations belong to this call alone and should be
    /// unsubscribed from the transport when it ends.
    pub per_request: bool,
}

impl CallOptions {
    /// Shared per-user queues `/user/{user}/queue/{queue}-scss` and `-err`.
    ///
    /// Concurrent calls on the same queue receive each other's answers;
    /// use [`CallOptions::for_request`] when calls may overlap.
    #[must_use]
    pub fn for_user(user: &UserId, queue: &str) -> Self {
        Self {
            success_destination: format!("/user/{user}/queue/{queue}-scss"),
            error_destination: format!("/user/{user}/queue/{queue}-err"),
            timeout: None,
            per_request: false,
        }
    }

    /// Per-user queues suffixed with a fresh id, private to one call.
    #[must_use]
    pub fn for_request(user: &UserId, queue: &str) -> Self {
        let id = uuid::Uuid::now_v7();
        Self {
            success_destination: format!("/user/{user}/queue/{queue}-scss/{id}"),
            error_destination: format!("/user/{user}/queue/{queue}-err/{id}"),
            timeout: None,
            per_request: true,
        }
    }

    /// Sets the call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Removes a call's handlers when dropped.
struct CallGuard<T: Transport> {
    channel: Arc<Channel<T>>,
    success: (String, HandlerId),
    error: (String, HandlerId),
    per_request: bool,
}

impl<T: Transport> Drop for CallGuard<T> {
    fn drop(&mut self) {
        let router = self.channel.router();
        router.unsubscribe(&self.success.0, self.success.1);
        router.unsubscribe(&self.error.0, self.error.1);
        if self.per_request {
            self.channel.release(&self.success.0);
            self.channel.release(&self.error.0);
        }
    }
}

type Completion = Arc<Mutex<Option<oneshot::Sender<Result<Value, CallError>>>>>;

/// Issues correlated calls over a [`Channel`].
pub struct CorrelatedClient<T: Transport> {
    channel: Arc<Channel<T>>,
    default_timeout: Duration,
}

impl<T: Transport> Clone for CorrelatedClient<T> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            default_timeout: self.default_timeout,
        }
    }
}

impl<T: Transport> CorrelatedClient<T> {
    /// Creates a client that waits `default_timeout` unless a call says
    /// otherwise.
    pub fn new(channel: Arc<Channel<T>>, default_timeout: Duration) -> Self {
        Self {
            channel,
            default_timeout,
        }
    }

    /// The channel calls go through.
    #[must_use]
    pub const fn channel(&self) -> &Arc<Channel<T>> {
        &self.channel
    }

    /// Publishes `payload` to `action` and waits for the answer.
    ///
    /// # Errors
    ///
    /// - [`CallError::Transport`] if subscribing or publishing fails.
    /// - [`CallError::Remote`] if the answer arrives on the error destination.
    /// - [`CallError::Timeout`] if nothing arrives in time.
    pub async fn call(
        &self,
        action: &str,
        payload: &Value,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        let completion: Completion = Arc::new(Mutex::new(Some(tx)));
        let router = self.channel.router();

        let on_success = Arc::clone(&completion);
        let success_id = router.subscribe(&options.success_destination, move |v| {
            if let Some(tx) = on_success.lock().take() {
                let _ = tx.send(Ok(v.clone()));
            }
            Ok(())
        });
        let on_error = Arc::clone(&completion);
        let error_id = router.subscribe(&options.error_destination, move |v| {
            if let Some(tx) = on_error.lock().take() {
                let _ = tx.send(Err(CallError::Remote {
                    message: normalize::error_message(v),
                }));
            }
            Ok(())
        });
        let _guard = CallGuard {
            channel: Arc::clone(&self.channel),
            success: (options.success_destination.clone(), success_id),
            error: (options.error_destination.clone(), error_id),
            per_request: options.per_request,
        };

        self.channel
            .ensure_subscribed(&options.success_destination)
            .await?;
        self.channel
            .ensure_subscribed(&options.error_destination)
            .await?;

        let reply_to = ReplyTo {
            success: options.success_destination.clone(),
            error: options.error_destination.clone(),
        };
        if let Err(e) = self
            .channel
            .publish_json(action, Some(reply_to), payload)
            .await
        {
            tracing::warn!(action, error = %e, "publish failed");
            return Err(e.into());
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                tracing::warn!(action, ?timeout, "call timed out");
                Err(CallError::Timeout(timeout))
            }
        }
    }
}
