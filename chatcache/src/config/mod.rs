//! Configuration for the `chatcache` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatcache/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::decrypt::DecryptConfig;
use crate::loader::LoaderConfig;
use crate::preload::PreloadConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    cache: CacheFileConfig,
    preload: PreloadFileConfig,
    loader: LoaderFileConfig,
    decrypt: DecryptFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    broker_url: Option<String>,
    api_url: Option<String>,
    user_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    page_size: Option<usize>,
    max_cached_chats: Option<usize>,
    preload_pages: Option<usize>,
    cleanup_threshold: Option<f64>,
}

/// `[preload]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PreloadFileConfig {
    item_delay_ms: Option<u64>,
    interval_ms: Option<u64>,
    recent_chats: Option<usize>,
}

/// `[loader]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LoaderFileConfig {
    stuck_timeout_ms: Option<u64>,
    check_interval_ms: Option<u64>,
    max_retries: Option<u32>,
}

/// `[decrypt]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DecryptFileConfig {
    batch_timeout_secs: Option<u64>,
    chunk_size: Option<usize>,
    chunk_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    // -- Network --
    /// Broker WebSocket URL.
    pub broker_url: Option<String>,
    /// Base URL of the REST API.
    pub api_url: Option<String>,
    /// User to act as.
    pub user_id: Option<String>,
    /// Timeout for connecting to the broker and for REST requests.
    pub connect_timeout: Duration,
    /// Default timeout of correlated calls.
    pub call_timeout: Duration,
    /// Interval between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Capacity of the transport's delivery channel.
    pub channel_capacity: usize,

    // -- Subsystems --
    /// Cache sizing.
    pub cache: CacheConfig,
    /// Chat preloader pacing.
    pub preload: PreloadConfig,
    /// Batch loader supervision.
    pub loader: LoaderConfig,
    /// Decryption call tuning.
    pub decrypt: DecryptConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            api_url: None,
            user_id: None,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            channel_capacity: 256,
            cache: CacheConfig::default(),
            preload: PreloadConfig::default(),
            loader: LoaderConfig::default(),
            decrypt: DecryptConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/chatcache/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default. Separate from `load()` so it can be
    /// tested without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let network = &file.network;

        Self {
            broker_url: cli
                .broker_url
                .clone()
                .or_else(|| network.broker_url.clone()),
            api_url: cli.api_url.clone().or_else(|| network.api_url.clone()),
            user_id: cli.user_id.clone().or_else(|| network.user_id.clone()),
            connect_timeout: network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            call_timeout: network
                .call_timeout_secs
                .map_or(defaults.call_timeout, Duration::from_secs),
            heartbeat_interval: network
                .heartbeat_secs
                .map_or(defaults.heartbeat_interval, Duration::from_secs),
            channel_capacity: network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            cache: CacheConfig {
                page_size: cli
                    .page_size
                    .or(file.cache.page_size)
                    .unwrap_or(defaults.cache.page_size)
                    .max(1),
                max_cached_chats: file
                    .cache
                    .max_cached_chats
                    .unwrap_or(defaults.cache.max_cached_chats)
                    .max(1),
                preload_pages: file
                    .cache
                    .preload_pages
                    .unwrap_or(defaults.cache.preload_pages),
                cleanup_threshold: file
                    .cache
                    .cleanup_threshold
                    .unwrap_or(defaults.cache.cleanup_threshold),
            },
            preload: PreloadConfig {
                item_delay: file
                    .preload
                    .item_delay_ms
                    .map_or(defaults.preload.item_delay, Duration::from_millis),
                interval: file
                    .preload
                    .interval_ms
                    .map_or(defaults.preload.interval, Duration::from_millis),
                recent_chats: file
                    .preload
                    .recent_chats
                    .unwrap_or(defaults.preload.recent_chats),
            },
            loader: LoaderConfig {
                stuck_timeout: file
                    .loader
                    .stuck_timeout_ms
                    .map_or(defaults.loader.stuck_timeout, Duration::from_millis),
                check_interval: file
                    .loader
                    .check_interval_ms
                    .map_or(defaults.loader.check_interval, Duration::from_millis),
                max_retries: file
                    .loader
                    .max_retries
                    .unwrap_or(defaults.loader.max_retries),
            },
            decrypt: DecryptConfig {
                batch_timeout: file
                    .decrypt
                    .batch_timeout_secs
                    .map_or(defaults.decrypt.batch_timeout, Duration::from_secs),
                single_timeout: defaults.decrypt.single_timeout,
                chunk_size: file
                    .decrypt
                    .chunk_size
                    .unwrap_or(defaults.decrypt.chunk_size)
                    .max(1),
                chunk_delay: file
                    .decrypt
                    .chunk_delay_ms
                    .map_or(defaults.decrypt.chunk_delay, Duration::from_millis),
            },
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Paged chat data cache client")]
pub struct CliArgs {
    /// WebSocket URL of the broker.
    #[arg(long, env = "CHATCACHE_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "CHATCACHE_API_URL")]
    pub api_url: Option<String>,

    /// User to act as.
    #[arg(long, env = "CHATCACHE_USER_ID")]
    pub user_id: Option<String>,

    /// Path to config file (default: `~/.config/chatcache/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Chat to fetch and print after the cache is warmed up.
    #[arg(long)]
    pub chat: Option<String>,

    /// Page of `--chat` to fetch.
    #[arg(long, default_value_t = 0)]
    pub page: usize,

    /// Items per page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATCACHE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatcache.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatcache").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
