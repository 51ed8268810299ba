//! `ChatCache` -- paged per-chat data cache for a chat client.
//!
//! Sits between a UI and a remote chat service that is reachable over a
//! publish/subscribe broker (request/response emulated with correlation
//! destinations) and a REST API.

pub mod api;
pub mod cache;
pub mod config;
pub mod correlation;
pub mod decrypt;
pub mod directory;
pub mod events;
pub mod ingest;
pub mod loader;
pub mod normalize;
pub mod preload;
pub mod router;
pub mod service;
pub mod session;
pub mod stream;
pub mod transport;
