//! `ChatCache` broker: a WebSocket publish/subscribe server.
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin chatcache-broker
//!
//! # Run on custom address, dropping clients after 2 x 5s without a heartbeat
//! cargo run --bin chatcache-broker -- --bind 127.0.0.1:8080 --heartbeat-secs 5
//! ```

use std::sync::Arc;

use chatcache_broker::broker::{self, BrokerState};
use chatcache_broker::config::{BrokerCliArgs, BrokerConfig};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let limits = config.limits();
    tracing::info!(
        addr = %config.bind_addr,
        max_payload_size = limits.max_payload_size,
        idle_timeout = ?limits.idle_timeout,
        "starting chatcache broker"
    );

    let state = Arc::new(BrokerState::with_limits(limits));

    match broker::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
