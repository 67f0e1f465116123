//! Connection configuration.
//!
//! Loaded from `config.json` in the qconn config directory, then overridden
//! by `QCONN_*` environment variables. The CLI applies its own flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Port the broker listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8000;

/// Where and how to reach the broker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Deadline in seconds for each framed read.
    pub read_timeout_secs: u64,
    /// Deadline in seconds for the TCP connect.
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            read_timeout_secs: 50,
            connect_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Configuration for `host` with every other setting at its default.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Returns the configuration directory path.
    ///
    /// `QCONN_CONFIG_DIR` wins; otherwise the platform config dir
    /// (e.g. `~/.config/qconn`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = env::var("QCONN_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("qconn"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Self {
        let mut config = Self::config_dir()
            .and_then(|dir| Self::load_from_file(&dir.join("config.json")))
            .unwrap_or_else(|e| {
                log::debug!("[Config] Using defaults: {e:#}");
                Self::default()
            });
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Parse a JSON config file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))
    }

    /// Apply `QCONN_*` overrides looked up through `lookup`.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("QCONN_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("QCONN_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(secs) = lookup("QCONN_READ_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.read_timeout_secs = secs;
        }
        if let Some(secs) = lookup("QCONN_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
    }

    /// `host:port` for dialling.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-read framer deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// TCP connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
