//! cumbia-relay binary: loads configuration, connects the chat backend and
//! serves the relay until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use cumbia_relay::backend::{BackendSession, ChatBackend, InMemoryBackend, TcpChatBackend};
use cumbia_relay::config::load_config;
use cumbia_relay::logging::init_subscriber;
use cumbia_relay::registry::ConnectionRegistry;
use cumbia_relay::relay::SignalingRelay;
use cumbia_relay::server::RelayServer;

/// Signaling relay for Cumbia chat.
#[derive(Parser, Debug)]
#[command(name = "cumbia-relay", about = "Signaling relay for Cumbia chat")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, env = "CUMBIA_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Chat backend address, `host:port`.
    #[arg(long)]
    backend: Option<String>,

    /// Use the in-process chat service instead of a remote backend.
    #[arg(long)]
    in_memory: bool,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(backend) = cli.backend {
        config.backend_addr = backend;
    }
    if cli.in_memory {
        config.in_memory = true;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_subscriber(&config.log_level);

    let backend: Arc<dyn ChatBackend> = if config.in_memory {
        info!("using in-process chat service");
        Arc::new(InMemoryBackend::new())
    } else {
        match TcpChatBackend::connect_checked(&config.backend_addr, config.call_timeout()).await {
            Ok(backend) => {
                info!(addr = %config.backend_addr, "connected to chat backend");
                Arc::new(backend)
            }
            Err(err) => {
                error!(addr = %config.backend_addr, error = %err, "could not reach chat backend");
                std::process::exit(1);
            }
        }
    };

    let session = Arc::new(BackendSession::new(backend, config.call_timeout()));
    let relay = Arc::new(
        SignalingRelay::new(Arc::new(ConnectionRegistry::new()), session.clone())
            .context("failed to start relay")?,
    );
    let server = RelayServer::new(config, relay);
    let bind_addr = server.config().bind_addr();

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "relay listening");

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    session.shutdown().await;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
