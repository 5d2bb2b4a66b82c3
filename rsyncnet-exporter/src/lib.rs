//! Prometheus exporter for rsync.net account usage.
//!
//! Every scrape of `/probe?target=<URL>` fetches the rsync.net usage report
//! feed at `target`, parses the account rows out of it and answers with a
//! fresh set of gauges. Nothing is cached between scrapes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   Prometheus    │────>│  Probe handler  │────>│    Collector    │──── GET target
//! │ (/probe?target) │<────│  (host check)   │<────│ (feed -> gauges)│
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! rsyncnet-exporter --allowed-host www.rsync.net
//! curl 'http://localhost:9770/probe?target=https://www.rsync.net/am/rss.xml'
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod family;
pub mod feed;
pub mod http;
pub mod telemetry;

pub use collector::{AccountCollector, Collector, CollectorError};
pub use config::{ConfigError, ExporterConfig, LogFormat, LoggingConfig};
pub use family::{MetricFamily, Sample, encode_text};
pub use feed::{Feed, FeedError, FeedItem};
pub use http::{AppState, HttpServer, ProbeError, create_router};
pub use telemetry::{ExporterMetrics, SharedMetrics};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| ConfigError::Logging(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| ConfigError::Logging(e.to_string()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_a_logging_error() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
        };

        // Whichever call installs the subscriber, the next one must fail.
        let _ = init_tracing(&config);
        let err = init_tracing(&config).unwrap_err();

        assert!(matches!(err, ConfigError::Logging(_)));
        assert!(err.to_string().contains("Failed to initialize tracing"), "{err}");
    }
}
