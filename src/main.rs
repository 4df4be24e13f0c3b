//! Crosstalk - real-time chat delivery hub
//!
//! Standalone binary wiring the hub to a TCP listener with the
//! in-memory store as both collaborators. A production deployment
//! replaces the store with implementations backed by the application's
//! database layer.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use crosstalk::{Config, Hub, MemoryStore, server};

#[derive(Parser, Debug)]
#[command(name = "crosstalk")]
#[command(about = "Real-time chat delivery hub")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("Crosstalk v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let listener = TcpListener::bind(&args.bind).await?;
    info!(addr = %args.bind, "Starting Crosstalk");

    let hub = Hub::spawn();
    let store = Arc::new(MemoryStore::new());

    tokio::select! {
        result = server::run(listener, hub, store.clone(), store, config) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Crosstalk shutdown");
    Ok(())
}
