//! Transport layer abstraction.
//!
//! A [`Transport`] is a one-way publish/subscribe pipe: it can publish a body
//! to a destination, subscribe to destinations, and hand back whatever is
//! delivered. It has no notion of request and response; that is layered on
//! top by [`crate::correlation`].
//!
//! Implementations:
//! - [`loopback::LoopbackBroker`]: in-process broker for tests and embedding
//! - [`ws::WsTransport`]: WebSocket client for `chatcache-broker`

pub mod channel;
pub mod loopback;
pub mod ws;

use std::fmt;

use chatcache_proto::broker::ReplyTo;
use chatcache_proto::codec::CodecError;

/// A body delivered to one of this client's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Destination the body was published to.
    pub destination: String,
    /// Response destinations supplied by the publisher, if any.
    pub reply_to: Option<ReplyTo>,
    /// Raw body bytes (JSON in practice).
    pub body: Vec<u8>,
}

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to a broker.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection to the broker has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The broker refused the operation.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async publish/subscribe transport.
///
/// Bodies are opaque bytes; serialization happens at higher layers.
pub trait Transport: Send + Sync + 'static {
    /// Publish `body` to `destination`.
    ///
    /// Returns once the body has been handed to the broker connection. A
    /// transport that is not connected fails immediately.
    fn publish(
        &self,
        destination: &str,
        reply_to: Option<ReplyTo>,
        body: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Start receiving bodies published to `destination`. Idempotent.
    fn subscribe(
        &self,
        destination: &str,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Stop receiving bodies published to `destination`.
    fn unsubscribe(
        &self,
        destination: &str,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next delivery for any subscribed destination.
    fn recv(&self) -> impl std::future::Future<Output = Result<Delivery, TransportError>> + Send;

    /// Whether the transport currently has a live broker connection.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
