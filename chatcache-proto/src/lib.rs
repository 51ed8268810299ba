//! Shared types for `ChatCache`: chat data items and the broker wire format.

pub mod broker;
pub mod codec;
pub mod message;
