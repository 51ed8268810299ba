//! `ChatCache` broker library.
//!
//! A WebSocket publish/subscribe broker. Clients connect, name themselves,
//! subscribe to destinations and publish opaque bodies; the broker fans each
//! publish out to the current subscribers of its destination. Exposed as a
//! library so tests and embedders can run it in-process.

pub mod broker;
pub mod config;
