//! Stampede Node - demo server for the request coalescing middleware.

use anyhow::{Context, Result};
use clap::Parser;
use stampede_node::config::NodeConfig;
use stampede_node::demo;
use stampede_node::middleware::CoalesceState;
use stampede_node::observability::{init_logging, LogFormat};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Stampede Node - request coalescing demo server
#[derive(Parser, Debug)]
#[command(name = "stampede-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides the config file)
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Serve every request directly without coalescing
    #[arg(long)]
    no_coalesce: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        NodeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(format) = args.log_format.as_deref() {
        config.log_format = LogFormat::parse(format);
    }
    if args.no_coalesce {
        config.coalescing.enabled = false;
    }
    config.validate().context("invalid configuration")?;

    init_logging(&config.log_level, config.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Stampede node");
    tracing::info!(
        listen_addr = %config.listen_addr,
        coalescing = config.coalescing.enabled,
        max_in_flight = config.coalescing.max_in_flight,
        stream_attach = ?config.coalescing.stream_attach,
        blacklisted = config.coalescing.blacklist.len(),
        "Node configuration"
    );

    let state = CoalesceState::from_settings(&config.coalescing);
    let app = demo::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!("Listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Stampede node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
