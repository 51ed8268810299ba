//! Frames exchanged between clients and the pub/sub broker.
//!
//! The broker protocol is one-way publish plus destination subscription.
//! There is no call/return: a requester names the destinations it wants
//! answers on in [`ReplyTo`] and subscribes to them itself. Bodies are
//! opaque to the broker (JSON in practice).
//!
//! Destinations of the form `/user/{id}/...` are private: only the client
//! that connected as `{id}` may subscribe to them.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

/// Prefix of destinations owned by a single user.
pub const USER_PREFIX: &str = "/user/";

/// Where the answer to a published request should be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    /// Destination for a successful response.
    pub success: String,
    /// Destination for an error response.
    pub error: String,
}

/// Frames sent by a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Identifies the client. Must be the first frame on a connection;
    /// the broker answers with [`ServerFrame::Connected`].
    Connect {
        /// The user this connection acts for.
        client_id: String,
    },
    /// Start receiving frames published to `destination`.
    Subscribe {
        /// Destination name.
        destination: String,
    },
    /// Stop receiving frames published to `destination`.
    Unsubscribe {
        /// Destination name.
        destination: String,
    },
    /// Publish a body to every subscriber of `destination`.
    Publish {
        /// Destination name.
        destination: String,
        /// Optional response destinations for request-style publishes.
        reply_to: Option<ReplyTo>,
        /// Opaque payload.
        body: Vec<u8>,
    },
    /// Keep-alive; answered with [`ServerFrame::HeartbeatAck`].
    Heartbeat,
}

/// Frames sent by the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// The connection is registered under `client_id`.
    Connected {
        /// Echo of the id from [`ClientFrame::Connect`].
        client_id: String,
    },
    /// A body published to a destination this client subscribes to.
    Deliver {
        /// Destination the body was published to.
        destination: String,
        /// Response destinations supplied by the publisher.
        reply_to: Option<ReplyTo>,
        /// Opaque payload.
        body: Vec<u8>,
    },
    /// The broker rejected a frame.
    Error {
        /// Human-readable error description.
        reason: String,
    },
    /// Answer to [`ClientFrame::Heartbeat`].
    HeartbeatAck,
}

/// Returns the owning user of a `/user/{id}/...` destination.
#[must_use]
pub fn user_destination_owner(destination: &str) -> Option<&str> {
    let rest = destination.strip_prefix(USER_PREFIX)?;
    let (owner, _) = rest.split_once('/')?;
    (!owner.is_empty()).then_some(owner)
}

/// Encodes a client frame.
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_client(frame: &ClientFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a client frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a valid frame.
pub fn decode_client(bytes: &[u8]) -> Result<ClientFrame, CodecError> {
    codec::decode(bytes)
}

/// Encodes a server frame.
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_server(frame: &ServerFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a server frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a valid frame.
pub fn decode_server(bytes: &[u8]) -> Result<ServerFrame, CodecError> {
    codec::decode(bytes)
}
