//! Configuration module for Granary.

use serde::Deserialize;
use std::path::Path;

use crate::{GranaryError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/granary.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/granary.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Refresh configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Maximum number of feeds fetched concurrently during a batch refresh.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Interval between background refresh passes in seconds.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// Maximum feed document size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Maximum number of articles taken from a single document.
    #[serde(default = "default_max_articles")]
    pub max_articles_per_feed: usize,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Total request timeout in seconds.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Maximum number of redirects to follow.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Whether to fetch feed icon images.
    #[serde(default = "default_fetch_icons")]
    pub fetch_icons: bool,
    /// Allow fetching from private/loopback hosts (test and intranet setups).
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_update_interval() -> u64 {
    900 // 15 minutes
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_articles() -> usize {
    200
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    20
}

fn default_total_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_fetch_icons() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            update_interval_secs: default_update_interval(),
            max_feed_size_bytes: default_max_feed_size(),
            max_articles_per_feed: default_max_articles(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            total_timeout_secs: default_total_timeout(),
            max_redirects: default_max_redirects(),
            fetch_icons: default_fetch_icons(),
            allow_private_hosts: false,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Refresh configuration.
    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(GranaryError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| GranaryError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `GRANARY_DB_PATH`: Override the database file path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = std::env::var("GRANARY_DB_PATH") {
            if !db_path.is_empty() {
                self.database.path = db_path;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - `max_concurrent_fetches` is zero
    /// - the total timeout is shorter than the connect timeout
    pub fn validate(&self) -> Result<()> {
        if self.refresh.max_concurrent_fetches == 0 {
            return Err(GranaryError::Validation(
                "refresh.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if self.refresh.total_timeout_secs < self.refresh.connect_timeout_secs {
            return Err(GranaryError::Validation(
                "refresh.total_timeout_secs must not be shorter than connect_timeout_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
