//! Daemon and client configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::{AppError, Result};

/// Listener settings for the daemon.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Host name or address to bind; the wildcard address when omitted.
    #[serde(default)]
    pub bind_address: Option<String>,
    /// Port to bind; `0` lets the system choose.
    #[serde(default)]
    pub port: u16,
    /// Largest accepted frame in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Size of the I/O worker pool shared by all connections.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: 0,
            max_frame_bytes: default_max_frame_bytes(),
            worker_threads: default_worker_threads(),
        }
    }
}

/// Connection settings for the client driver.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Remote host running the daemon.
    #[serde(default = "default_host")]
    pub host: String,
    /// Remote daemon port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Overall deadline for connect retries.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Pause between refused connection attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            connect_timeout_seconds: default_connect_timeout_seconds(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl ClientConfig {
    /// Client settings targeting `host:port` with default retry timing.
    #[must_use]
    pub fn for_address(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Connect deadline as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Retry pause as a [`Duration`].
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Port to connect to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no port was configured.
    pub fn require_port(&self) -> Result<u16> {
        self.port
            .ok_or_else(|| AppError::Config("client port must be specified".into()))
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::Config("client host must be specified".into()));
        }
        if self.retry_interval_ms == 0 {
            return Err(AppError::Config(
                "retry_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_worker_threads() -> usize {
    4
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    200
}

/// Configuration parsed from `exec-daemon.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Daemon listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Client driver settings.
    #[serde(default)]
    pub client: ClientConfig,
}

impl DaemonConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_frame_bytes == 0 {
            return Err(AppError::Config(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }
        if self.server.worker_threads == 0 {
            return Err(AppError::Config(
                "worker_threads must be greater than zero".into(),
            ));
        }
        self.client.validate()
    }
}
