//! otun-server - the otun tunnel edge.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use otun_server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "otun-server")]
#[command(about = "otun tunnel edge server")]
#[command(version)]
struct Args {
    /// Control port address for tunnel client connections
    #[arg(long, default_value = ":4443")]
    control: String,

    /// HTTPS port address for public traffic
    #[arg(long, default_value = ":443")]
    https: String,

    /// HTTP port address for ACME challenges (and HTTP-only mode)
    #[arg(long, default_value = ":80")]
    http: String,

    /// Base domain for tunnels (e.g. tunnel.example.com). Empty runs
    /// HTTP-only mode.
    #[arg(long, default_value = "")]
    domain: String,

    /// Directory to store TLS certificates
    #[arg(long, default_value = "/var/lib/otun/certs")]
    certs: PathBuf,

    /// Comma-separated list of valid API keys (if set, authentication is
    /// required)
    #[arg(long = "api-keys", default_value = "")]
    api_keys: String,

    /// Heartbeat timeout in seconds before a silent tunnel is evicted
    #[arg(long, default_value_t = 90)]
    heartbeat_timeout: u64,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn setup_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.debug)?;

    let api_keys: Vec<String> = args
        .api_keys
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();
    if !api_keys.is_empty() {
        info!(key_count = api_keys.len(), "API key authentication enabled");
    }

    let config = ServerConfig {
        control_addr: args.control,
        http_addr: args.http,
        https_addr: args.https,
        domain: Some(args.domain).filter(|d| !d.is_empty()),
        cert_dir: args.certs,
        api_keys,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
    };

    let server = Server::bind(config).await.context("failed to start server")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    server.run(cancel).await.context("server error")?;
    info!("server stopped");
    Ok(())
}
