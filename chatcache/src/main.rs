//! `chatcache` -- warms the chat cache for a user and prints a page.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/chatcache/config.toml`).
//!
//! ```bash
//! cargo run --bin chatcache -- --broker-url ws://127.0.0.1:9000/ws \
//!     --api-url http://127.0.0.1:8080/ --user-id alice --chat c1 --page 0
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chatcache::api::HttpApi;
use chatcache::config::{CliArgs, ClientConfig};
use chatcache::service::ChatData;
use chatcache::session::Session;
use chatcache::transport::ws::{WsOptions, WsTransport};
use chatcache_proto::message::{ChatId, Timestamp, UserId};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("chatcache starting");

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "chatcache failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Stdout carries the printed chat data, so logs go to a file. Returns a
/// [`WorkerGuard`] that must be held until shutdown so buffered entries are
/// flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatcache.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(cli: &CliArgs, config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (Some(broker_url), Some(api_url), Some(user_id)) =
        (&config.broker_url, &config.api_url, &config.user_id)
    else {
        return Err("--broker-url, --api-url and --user-id are required".into());
    };

    let options = WsOptions {
        connect_timeout: config.connect_timeout,
        heartbeat_interval: config.heartbeat_interval,
        channel_capacity: config.channel_capacity,
        ..WsOptions::default()
    };
    let transport = WsTransport::connect(broker_url, user_id, options).await?;
    let api = HttpApi::new(api_url, config.connect_timeout)?;
    let session = Session::new(Arc::new(transport), api, UserId::new(user_id), config);

    let active = cli.chat.as_deref().map(ChatId::new);
    let report = session.init_cache(active.as_ref()).await?;
    println!(
        "cache warmed: {} chats loaded, {} failed",
        report.loaded.len(),
        report.failed.len()
    );

    if let Some(chat) = &active {
        let data = session.get_data(chat, cli.page, false).await?;
        print_page(chat, cli.page, &data);
    }

    let stats = session.service().stats();
    println!(
        "cached chats: {}  pending: {}  access order: {}  needs cleanup: {}",
        stats.cached_chats, stats.pending_requests, stats.access_order_len, stats.needs_cleanup
    );
    Ok(())
}

fn print_page(chat: &ChatId, page: usize, data: &ChatData) {
    let source = if data.from_cache { "cache" } else { "server" };
    println!(
        "chat {chat} page {page} ({source}): {} messages, {} files",
        data.messages.len(),
        data.files.len()
    );
    for message in &data.messages {
        println!(
            "[{}] {}: {}",
            format_time(message.timestamp),
            message.sender_id,
            message.content
        );
    }
    for file in &data.files {
        println!(
            "[{}] {} shared {} ({} bytes)",
            format_time(file.timestamp),
            file.sender_id,
            file.name,
            file.size
        );
    }
}

fn format_time(ts: Timestamp) -> String {
    i64::try_from(ts.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || ts.to_string(),
            |dt| dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        )
}
