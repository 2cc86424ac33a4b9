//! # sockbus
//!
//! Demo chat server: wires settings, logging, metrics, and the bus together
//! and serves it over HTTP.

#![deny(unsafe_code)]

mod chat;
mod logging;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use sockbus_broker::MemoryBroker;
use sockbus_server::{Server, routes};
use sockbus_settings::BusSettings;

/// Demo chat server for the sockbus event bus.
#[derive(Parser, Debug)]
#[command(name = "sockbus", about = "WebSocket event bus demo server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Path of the WebSocket endpoint.
    #[arg(long, default_value = "/socket.io/")]
    path: String,

    /// JSON settings file (overrides `SOCKBUS_SETTINGS`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn load_settings(path: Option<&Path>) -> Result<BusSettings> {
    match path {
        Some(path) => sockbus_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => sockbus_settings::load_settings().context("Failed to load settings"),
    }
}

fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || std::future::ready(handle.render())))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    logging::init(&args.log_level, args.json_logs);

    let settings = load_settings(args.settings.as_deref())?;
    let metrics = sockbus_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    // Single-process broker; several processes would share an external one.
    let broker = MemoryBroker::with_capacity(settings.subscription_buffer);
    let server = Server::new(broker, settings)
        .await
        .context("Failed to start server")?;
    chat::install(&server);

    let app = routes::ws_router(server.clone(), &args.path).merge(metrics_router(metrics));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, path = %args.path, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    server.shutdown().await;
    tracing::info!("server stopped");
    Ok(())
}
