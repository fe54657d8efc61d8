use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use poolgate::config::{load_config, ProxyConfig};
use poolgate::lifecycle::{listen_for_signals, Shutdown};
use poolgate::observability::init_logging;
use poolgate::HttpServer;

#[derive(Parser)]
#[command(name = "poolgate", about = "Pooling HTTP reverse proxy", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    init_logging(&config.observability);
    tracing::info!(
        bind_address = %config.listener.bind_address,
        pools = config.pools.len(),
        "poolgate starting"
    );

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    tokio::spawn(listen_for_signals(shutdown.clone()));

    let server = HttpServer::new(config)?;
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
