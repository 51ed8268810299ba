//! Broker settings.
//!
//! Each field is taken from the first source that sets it: command line
//! (or its environment variable), then the `[server]` table of
//! `config.toml`, then [`BrokerConfig::default`].
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1:9000"
//! max_payload_size = 262144
//! heartbeat_secs = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::BrokerLimits;

/// Directory under the platform config dir holding `config.toml`.
const CONFIG_DIR_NAME: &str = "chatcache-broker";

/// Errors raised while reading broker settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read, or an explicitly
    /// named file is missing.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("invalid broker config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    server: ServerTable,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerTable {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
    heartbeat_secs: Option<u64>,
}

/// Command line of `chatcache-broker`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ChatCache pub/sub broker")]
pub struct BrokerCliArgs {
    /// Listen address.
    #[arg(short, long, env = "CHATCACHE_BROKER_ADDR")]
    pub bind: Option<String>,

    /// Config file to read instead of the platform default.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted publish body, in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Expected client heartbeat period in seconds; 0 never drops idle
    /// connections.
    #[arg(long, env = "CHATCACHE_BROKER_HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "CHATCACHE_BROKER_LOG")]
    pub log_level: String,
}

/// Resolved broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Listen address.
    pub bind_addr: String,
    /// Largest accepted publish body, in bytes.
    pub max_payload_size: usize,
    /// How often clients are expected to send a heartbeat. `None` keeps
    /// silent connections open forever.
    pub heartbeat_interval: Option<Duration>,
    /// Tracing filter.
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let limits = BrokerLimits::default();
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_payload_size: limits.max_payload_size,
            heartbeat_interval: Some(Duration::from_secs(10)),
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Reads the config file named by `cli` (or the platform default) and
    /// applies the command line over it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if an explicit `--config` file is missing or any
    /// config file is unreadable; [`ConfigError::Toml`] if it does not parse.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => Some(read_file(path)?),
            None => read_default_file()?,
        };
        let mut config = Self::default();
        if let Some(file) = file {
            config.apply_server_table(file.server);
        }
        config.apply_cli(cli);
        Ok(config)
    }

    /// Limits handed to the broker state. Connections are dropped after two
    /// missed heartbeats.
    #[must_use]
    pub fn limits(&self) -> BrokerLimits {
        BrokerLimits {
            max_payload_size: self.max_payload_size,
            idle_timeout: self.heartbeat_interval.map(|every| every * 2),
        }
    }

    fn apply_server_table(&mut self, server: ServerTable) {
        if let Some(addr) = server.bind_addr {
            self.bind_addr = addr;
        }
        if let Some(size) = server.max_payload_size {
            self.max_payload_size = size;
        }
        if let Some(secs) = server.heartbeat_secs {
            self.heartbeat_interval = heartbeat(secs);
        }
    }

    fn apply_cli(&mut self, cli: &BrokerCliArgs) {
        if let Some(addr) = &cli.bind {
            self.bind_addr.clone_from(addr);
        }
        if let Some(size) = cli.max_payload_size {
            self.max_payload_size = size;
        }
        if let Some(secs) = cli.heartbeat_secs {
            self.heartbeat_interval = heartbeat(secs);
        }
        self.log_level.clone_from(&cli.log_level);
    }
}

fn heartbeat(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// A missing default file is not an error.
fn read_default_file() -> Result<Option<ConfigFile>, ConfigError> {
    let Some(dir) = dirs::config_dir() else {
        return Ok(None);
    };
    let path = dir.join(CONFIG_DIR_NAME).join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    read_file(&path).map(Some)
}
