use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "prudad",
    about = "Prudad — license authority server daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Pruda HTTP server
    Serve {
        /// Port to listen on (default: $PRUDA_PORT or 8080)
        #[arg(long, env = "PRUDA_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $PRUDA_HOST or 0.0.0.0)
        #[arg(long, env = "PRUDA_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Expiry sweep interval in seconds (default: $PRUDA_SWEEP_INTERVAL or 900)
        #[arg(long, env = "PRUDA_SWEEP_INTERVAL", default_value = "900")]
        sweep_interval: u64,
        /// Log level: error, warn, info, debug, verbose (default: $PRUDA_LOG_LEVEL or info)
        #[arg(long, env = "PRUDA_LOG_LEVEL")]
        log_level: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Commands::Serve { ref log_level, .. } = cli.command;
    let raw = log_level
        .clone()
        .or_else(|| std::env::var("PRUDA_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".into());
    let effective_log_level = if raw.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        raw
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            sweep_interval,
            log_level: _,
        } => cmd_serve(host, port, sweep_interval).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, sweep_interval: u64) -> Result<()> {
    let cfg = pruda_server::ServerConfig {
        host,
        port,
        api_key: std::env::var("PRUDA_API_KEY").ok(),
        data_dir: std::env::var("PRUDA_DATA_DIR").ok().map(Into::into),
        sweep_interval: Duration::from_secs(sweep_interval.max(1)),
        ..Default::default()
    };

    pruda_server::run(cfg).await
}
