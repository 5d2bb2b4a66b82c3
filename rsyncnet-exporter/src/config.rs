//! Configuration for the rsync.net exporter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Failed to initialize tracing: {0}")]
    Logging(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Probe settings.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to listen on (default: "[::]:9770").
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "[::]:9770".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Settings for the `/probe` endpoint and the upstream fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// The only host a probe target may point at (default: "www.rsync.net").
    #[serde(default = "default_allowed_host")]
    pub allowed_host: String,

    /// Upstream request timeout in seconds (default: 5).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Fail the scrape when the feed contains no account rows.
    #[serde(default)]
    pub require_accounts: bool,
}

fn default_allowed_host() -> String {
    "www.rsync.net".to_string()
}

fn default_timeout() -> u64 {
    5
}

impl ProbeConfig {
    /// Upstream request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            allowed_host: default_allowed_host(),
            timeout_secs: default_timeout(),
            require_accounts: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.http.listen
            )));
        }

        let host = &self.probe.allowed_host;
        if host.is_empty() {
            return Err(ConfigError::Validation(
                "allowed_host must not be empty".to_string(),
            ));
        }

        // A bare host name; scheme, port and path are never part of the comparison.
        if host.contains(['/', ':']) || host.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(format!(
                "allowed_host must be a bare host name, got {host:?}"
            )));
        }

        if self.probe.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
