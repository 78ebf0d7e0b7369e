//! Trickroom - PostgreSQL wire protocol endpoint

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use log::info;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use trickroom::executor::SampleExecutor;
use trickroom::network::{Server, ServerConfig, SessionConfig};

/// Trickroom - speaks the PostgreSQL wire protocol and answers with sample data
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5432")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Maximum concurrent connections
    #[arg(short = 'c', long, default_value = "100")]
    max_connections: usize,

    /// Close connections that stay silent for this many seconds
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    /// Version reported to clients in the server_version parameter
    #[arg(long, default_value = "15.0")]
    server_version: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let host: IpAddr = args.host.parse().context("Invalid host address")?;
    let config = ServerConfig {
        listen_addr: SocketAddr::from((host, args.port)),
        max_connections: args.max_connections,
        session: SessionConfig {
            read_timeout: args.read_timeout_secs.map(Duration::from_secs),
            server_version: args.server_version.clone(),
            ..SessionConfig::default()
        },
    };

    info!("Server configuration:");
    info!("   - Address: {}", config.listen_addr);
    info!("   - Max connections: {}", config.max_connections);
    info!("   - Read timeout: {:?}", config.session.read_timeout);
    info!(
        "Connect with: psql -h {} -p {} -U postgres",
        args.host, args.port
    );

    let server = Server::new(config, Arc::new(SampleExecutor::default()));

    // Stop accepting on Ctrl+C
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutting down server...");
    };

    server
        .run_until(shutdown)
        .await
        .context("Server terminated with an error")?;

    Ok(())
}
