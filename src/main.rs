// Main entry point for the colorize-gateway server.
// Parses configuration, builds the shared state (rate limiter, session store,
// worker pool, colorization pipeline) and serves the HTTP API until a
// shutdown signal arrives.

use clap::Parser;
use colorize_gateway::{AppConfig, AppState, create_app, shutdown_signal::shutdown_signal, web};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const WORKER_DRAIN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Parse command line args and environment variables
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting colorize-gateway...");

    let (state, background) = match AppState::from_config(&config) {
        Ok(built) => built,
        Err(err) => {
            tracing::error!("FATAL: Failed to initialize service: {}", err);
            std::process::exit(1);
        }
    };
    tracing::info!(
        limiter = state.limiter.backend_name(),
        workers = state.workers.size(),
        burst_limit = config.burst_limit,
        daily_limit = config.daily_limit,
        "Service initialized"
    );
    let workers = state.workers.clone();

    let app = create_app(state);

    let (addr, listener) = match web::create_listener(&config.host, config.port).await {
        Ok(bound) => bound,
        Err(err) => {
            tracing::error!(
                "FATAL: Failed to bind to {}:{}: {}",
                config.host,
                config.port,
                err
            );
            std::process::exit(1);
        }
    };
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(err) = served {
        tracing::error!("Server error: {}", err);
    }

    tracing::info!("Stopping background tasks...");
    background.stop();
    if !workers.shutdown(WORKER_DRAIN_GRACE).await {
        tracing::warn!("Exiting with work still in flight");
    }

    tracing::info!("Server has been shut down.");
}
