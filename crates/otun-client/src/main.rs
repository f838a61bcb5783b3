//! otun - expose local services to the internet.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use otun_client::{config, Client, ClientError};

#[derive(Parser, Debug)]
#[command(name = "otun")]
#[command(about = "Expose local services to the internet")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose a local HTTP service
    ///
    /// Examples:
    ///   otun http 3000                # expose localhost:3000
    ///   otun http 8080 -s myapp       # expose localhost:8080 as "myapp"
    ///   otun http 192.168.1.10:3000   # expose a service on your network
    Http(HttpArgs),
    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct HttpArgs {
    /// Local port or host:port to expose
    target: String,

    /// Custom subdomain (random if not specified)
    #[arg(short = 's', long)]
    subdomain: Option<String>,

    /// Tunnel server address
    #[arg(short = 'S', long)]
    server: Option<String>,

    /// API key for authentication
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Path to config file (default: ~/.otun.yaml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Maximum reconnection attempts (0 = unlimited)
    #[arg(long)]
    max_retries: Option<u32>,
}

const DEFAULT_SERVER: &str = "tunnel.otun.dev:4443";

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
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("otun {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Http(args) => run_http(args).await,
    }
}

async fn run_http(args: HttpArgs) -> Result<()> {
    let file = match config::load(args.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: {e}");
            None
        }
    }
    .unwrap_or_default();

    // Precedence: explicitly-set CLI flag > config file value > default.
    let server = args
        .server
        .or(file.server)
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let token = args.token.or(file.token);
    let subdomain = args.subdomain.or(file.subdomain);
    let debug = args.debug || file.debug.unwrap_or(false);
    let reconnect = if args.no_reconnect {
        false
    } else {
        file.reconnect.unwrap_or(true)
    };
    let max_retries = args.max_retries.or(file.max_retries).unwrap_or(0);

    setup_logging(debug)?;

    // A bare port means localhost.
    let local_addr = if args.target.contains(':') {
        args.target.clone()
    } else {
        format!("localhost:{}", args.target)
    };

    let mut client = Client::new(server, local_addr)
        .with_reconnect(reconnect)
        .with_max_retries(max_retries);
    if let Some(subdomain) = subdomain {
        client = client.with_subdomain(subdomain);
    }
    if let Some(token) = token {
        client = client.with_token(token);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match client.run_with_reconnect(cancel).await {
        Ok(()) | Err(ClientError::Shutdown) => {
            info!("Shutting down...");
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
