//! MCP relay bridge
//!
//! Launches the configured MCP worker, connects it to the remote relay over
//! a WebSocket and serves the local event stream:
//! - worker stdio ⇄ `ws(s)://` uplink
//! - `http://<host>:<port>/events` for observers

use anyhow::{Context, Result};
use clap::Parser;
use mcp_relay_core::RelayConfig;
use mcp_relay_server::{AppState, BridgeSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mcp-relay")]
#[command(version)]
#[command(about = "Bridge a local MCP server to a remote relay and stream its state over SSE")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, short, default_value = "relay-config.json")]
    config: PathBuf,

    /// Override the uplink endpoint (ws:// or wss://)
    #[arg(long)]
    endpoint: Option<String>,

    /// Override the HTTP port
    #[arg(long)]
    port: Option<u16>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;
    let (host, port) = (config.bridge.host.clone(), config.bridge.port);
    let status_interval = config.bridge.status_interval();

    let supervisor = Arc::new(BridgeSupervisor::new(&config)?);
    info!(worker = %supervisor.worker_name(), "MCP relay bridge starting");
    supervisor
        .start()
        .await
        .context("Failed to start the bridge")?;

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    let http_shutdown = CancellationToken::new();
    let http = tokio::spawn(mcp_relay_server::serve(
        listener,
        AppState::from_supervisor(supervisor.clone()),
        http_shutdown.clone(),
    ));
    info!("Event stream at http://{}:{}/events", host, port);

    let status_task = tokio::spawn(log_status(supervisor.clone(), status_interval));

    shutdown_signal().await;
    info!("Shutting down");

    status_task.abort();
    supervisor.stop().await;
    http_shutdown.cancel();
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    info!("Bye");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(endpoint) = &cli.endpoint {
        config.uplink.endpoint = endpoint.clone();
    }
    if let Some(port) = cli.port {
        config.bridge.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn log_status(supervisor: Arc<BridgeSupervisor>, every: Duration) {
    if every.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let status = supervisor.get_status();
        info!(
            connected = status.connected,
            worker_running = status.worker_running,
            reconnect_attempts = status.reconnect_attempts,
            queued = status.queued_messages,
            subscribers = supervisor.hub().subscriber_count(),
            "Bridge status"
        );
        if supervisor.uplink_exhausted() {
            warn!("Uplink gave up reconnecting; restart the bridge to try again");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
