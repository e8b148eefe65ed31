//! echolocate - acoustic 2-D event localization service
//!
//! Three fixed listeners post short loudness traces; the service detects
//! clap onsets, estimates per-listener clock offsets from sync rounds,
//! and localizes events by TDOA, pushing results over a WebSocket.

use clap::Parser;
use echolocate::config;
use echolocate::server::{self, AppState};
use echolocate::SharedState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Acoustic event localization microservice
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host address to bind to (overrides configuration)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind to (overrides configuration)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("echolocate={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("echolocate starting...");

    let mut config = config::resolve_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    info!(
        "Listeners: {}",
        config
            .listeners
            .iter()
            .map(|l| format!("{} at ({}, {})", l.id, l.x, l.y))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(SharedState::new(&config));
    let app = AppState {
        config: Arc::new(config),
        state,
    };

    info!("Starting HTTP server on {}...", bind_addr);
    server::start(&bind_addr, app).await?;

    Ok(())
}
