//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RELAYPIPE_RELAY_HOST`, `RELAYPIPE_BASE_PORT`,
//!    `RELAYPIPE_SERVER`, `RELAYPIPE_WORKERS`
//! 2. **Config file** — path via `--config <path>`, or `relaypipe.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! host = "0.0.0.0"
//! base_port = 27001            # channel i listens on base_port + i
//! channels = 8
//! handshake_timeout_secs = 30
//! pairing_timeout_secs = 3600  # how long the first peer of a pair waits
//! idle_timeout_secs = 0        # 0 = no idle limit on a running pipe
//! buffer_size = 16384
//! sweep_interval_secs = 30
//!
//! [client]
//! server = "127.0.0.1"
//! base_port = 27001
//! workers = 8
//! chunk_size = 1024
//! connect_timeout_secs = 10
//! io_timeout_secs = 3600
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "relaypipe.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay listener and session-lifetime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Interface to bind (default `0.0.0.0`).
    #[serde(default = "default_relay_host")]
    pub host: String,
    /// First channel port (default 27001). `0` binds ephemeral ports.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Number of parallel channels to listen on (default 8).
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Seconds a new connection has to answer `who?` (default 30).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Seconds a half-registered session may wait for its peer (default 3600).
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,
    /// Seconds without traffic before a pipe is torn down (default 0 = never).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Pipe read buffer in bytes (default 16 KiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds between expiry sweeps of stale sessions (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Parallel transfer client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Relay host name or address (default `127.0.0.1`).
    #[serde(default = "default_server")]
    pub server: String,
    /// Must match the relay's `base_port`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Parallel channels per transfer (default 8). Both ends must agree.
    #[serde(default = "default_workers")]
    pub workers: u16,
    /// Planning granularity in bytes (default 1024).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-channel deadline for relay replies, headers and acks (default 3600).
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_relay_host() -> String {
    "0.0.0.0".to_string()
}
fn default_base_port() -> u16 {
    27001
}
fn default_channels() -> u16 {
    8
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_pairing_timeout() -> u64 {
    3600
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_server() -> String {
    "127.0.0.1".to_string()
}
fn default_workers() -> u16 {
    8
}
fn default_chunk_size() -> usize {
    1024
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_io_timeout() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            base_port: default_base_port(),
            channels: default_channels(),
            handshake_timeout_secs: default_handshake_timeout(),
            pairing_timeout_secs: default_pairing_timeout(),
            idle_timeout_secs: 0,
            buffer_size: default_buffer_size(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            base_port: default_base_port(),
            workers: default_workers(),
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    /// `None` when idle pipes are allowed to live forever.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Never zero, so the sweep interval timer is always valid.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `relaypipe.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject counts and sizes that leave nothing to do.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field: &'static str| ConfigError::Invalid {
            field,
            reason: "must be at least 1",
        };
        if self.relay.channels == 0 {
            return Err(zero("relay.channels"));
        }
        if self.client.workers == 0 {
            return Err(zero("client.workers"));
        }
        if self.client.chunk_size == 0 {
            return Err(zero("client.chunk_size"));
        }
        Ok(())
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    /// Unparseable numbers are logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RELAYPIPE_RELAY_HOST") {
            self.relay.host = host;
        }
        if let Some(server) = lookup("RELAYPIPE_SERVER") {
            self.client.server = server;
        }
        if let Some(raw) = lookup("RELAYPIPE_BASE_PORT") {
            match raw.parse::<u16>() {
                Ok(port) => {
                    self.relay.base_port = port;
                    self.client.base_port = port;
                }
                Err(e) => warn!(value = %raw, "ignoring RELAYPIPE_BASE_PORT: {e}"),
            }
        }
        if let Some(raw) = lookup("RELAYPIPE_WORKERS") {
            match raw.parse::<u16>() {
                Ok(n) if n > 0 => self.client.workers = n,
                Ok(_) => warn!("ignoring RELAYPIPE_WORKERS=0"),
                Err(e) => warn!(value = %raw, "ignoring RELAYPIPE_WORKERS: {e}"),
            }
        }
    }
}
