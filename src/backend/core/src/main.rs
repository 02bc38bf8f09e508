//! Taskflow engine - main entry point
//!
//! Runs the recurrence, reminder, audit and live-sync consumers and serves
//! the live-sync WebSocket and audit reads over HTTP.

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use taskflow_core::{
    api::{self, AppState},
    config::Config,
    engine::Engine,
    telemetry::{self, LogFormat},
};

#[derive(Parser)]
#[command(
    name = "taskflow-engine",
    version,
    about = "Event-driven task lifecycle engine"
)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TASKFLOW_CONFIG")]
    config: Option<String>,

    /// Log format override: json, pretty or compact
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// HTTP port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(format) = args.log_format {
        config.telemetry.logging.format = format;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Taskflow engine");

    let addr = config.server.socket_addr()?;
    let shutdown_timeout = config.server.shutdown_timeout;

    let engine = Engine::connect(config).await?;
    let shutdown = CancellationToken::new();
    let running = engine.start(&shutdown);

    let app_state = AppState {
        live_sync: Arc::clone(engine.live_sync()),
        audit: Arc::clone(engine.audit()),
        dead_letters: engine.dead_letters().clone(),
        metrics: telemetry.metrics.clone(),
        consumers: Arc::new(running.consumer_stats()),
    };
    let app = api::build_router(app_state);

    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // The server may also stop on its own; consumers follow either way.
    shutdown.cancel();
    if !running.shutdown(shutdown_timeout).await {
        tracing::warn!("Engine did not stop cleanly");
    }

    telemetry.shutdown();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
