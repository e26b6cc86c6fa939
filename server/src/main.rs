//! PiggyChick server - Main entry point.
//!
//! This binary starts the PRD browser backend with:
//! - Structured JSON logging
//! - A startup check of the roots config file
//! - Graceful shutdown handling (SIGTERM/SIGINT) that also ends open
//!   change streams
//!
//! # Configuration
//!
//! See [`pgch_server::config`] for environment variables. Flags given on the
//! command line take precedence.
//!
//! # Example
//!
//! ```bash
//! pgch --port 4000 --config ~/projects/piggychick.jsonc
//! RUST_LOG=debug PGCH_HOST=0.0.0.0 pgch
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use pgch_server::config::Settings;
use pgch_server::roots::RootsConfig;
use pgch_server::routes::{create_router, AppState};

/// Serve PRD task folders from configured project roots.
#[derive(Parser, Debug)]
#[command(name = "pgch", version, about)]
struct Cli {
    /// Port to listen on (overrides PGCH_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides PGCH_HOST)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Roots config file (overrides PGCH_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format_args!("{err:#}"), "Server exited with error");
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env().context("invalid environment settings")?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(config) = cli.config {
        settings.config_path = config;
    }

    let roots = RootsConfig::new(&settings.config_path);
    let configured = roots
        .load_roots()
        .with_context(|| format!("failed to load {}", settings.config_path.display()))?;
    info!(
        config = %settings.config_path.display(),
        roots = configured.len(),
        "PiggyChick server starting"
    );

    let state = AppState::new(roots);
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let addr = SocketAddr::new(settings.host, settings.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM and cancels `streams`, so long-lived SSE
/// responses finish and graceful shutdown can complete.
async fn shutdown_signal(streams: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    streams.cancel();
}
