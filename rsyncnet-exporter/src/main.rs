//! Prometheus exporter for rsync.net account usage.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use rsyncnet_exporter::{AppState, ExporterConfig, ExporterMetrics, HttpServer, init_tracing};

/// Prometheus exporter for rsync.net account usage.
#[derive(Parser, Debug)]
#[command(name = "rsyncnet-exporter")]
#[command(about = "Export rsync.net account usage as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Host that probe targets must point at (overrides config).
    #[arg(long, env = "RSYNC_NET_HOST")]
    allowed_host: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides config).
    #[arg(long, env = "RSYNC_NET_EXPORTER_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    if let Some(listen) = args.listen {
        config.http.listen = listen;
    }
    if let Some(allowed_host) = args.allowed_host {
        config.probe.allowed_host = allowed_host;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rsync.net exporter");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen_addr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let metrics = Arc::new(ExporterMetrics::new());
    let state = AppState::new(config.probe.clone(), metrics)?;
    let http_server = HttpServer::bind(state, listen_addr).await?;

    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    // Wait for shutdown signal, or for the server to stop on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut http_task => {
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server exited unexpectedly")),
                Ok(Err(e)) => {
                    error!("HTTP server error: {}", e);
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
    }

    shutdown_tx.send(true)?;

    match tokio::time::timeout(Duration::from_secs(5), http_task).await {
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => error!("HTTP server did not stop within 5s"),
    }

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
