//! Pacing Gateway Binary
//!
//! Starts the scheduling engine against the simulated venue and serves the
//! request API.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin pacing-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `PACER_VENUE_HOST`: Venue host (default: 127.0.0.1)
//! - `PACER_MARKET_DATA_PORT` / `PACER_HISTORICAL_PORT` / `PACER_REFERENCE_PORT`: Session ports (default: 4002)
//! - `PACER_HTTP_PORT`: Health, metrics and request API port (default: 8083)
//! - `PACER_HTTP_MAX_TRACKED`: Handles the request API keeps addressable (default: 10000)
//! - `PACER_LIMIT_<CLASS>`: Restriction policy override, `N` or `N/SECS`
//! - `PACER_REQUEST_TIMEOUT_SECS`: Venue response deadline (default: 60)
//! - `PACER_TRADING_DAY_TZ`: Trading day time zone (default: America/New_York)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `PACER_ENVIRONMENT`: `deployment.environment` span resource attribute (default: simulated)
//! - `RUST_LOG`: Filter directives, merged over per-module defaults

use std::sync::Arc;
use std::time::Duration;

use pacing_gateway::infrastructure::telemetry;
use pacing_gateway::{AppState, Gateway, GatewayConfig, HttpServer, SimulatedVenue, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Pacing Gateway");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, metrics disabled");
    }

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let venue = Arc::new(SimulatedVenue::new(config.simulated_venue_config()));
    let gateway = Arc::new(Gateway::new(config.gateway_options(), venue)?);

    let state = Arc::new(AppState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&gateway),
        config.server.max_tracked_requests,
    ));
    let http_server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());

    let server_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Pacing gateway ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await.is_err() {
        tracing::warn!("HTTP server did not stop before the shutdown timeout");
    }

    let stopping = Arc::clone(&gateway);
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;

    tracing::info!("Pacing gateway stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        venue_host = %config.venue.host,
        market_data_port = config.venue.market_data_port,
        historical_port = config.venue.historical_port,
        reference_port = config.venue.reference_port,
        http_port = config.server.http_port,
        max_tracked_requests = config.server.max_tracked_requests,
        "Configuration loaded"
    );
    tracing::debug!(
        request_timeout_secs = config.scheduler.request_timeout.as_secs(),
        max_attempts = config.scheduler.max_attempts,
        trading_day_tz = %config.splitter.time_zone,
        trading_day_boundary = %config.splitter.boundary,
        "Scheduling settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
