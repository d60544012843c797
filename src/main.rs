//! Book Tracker - Order Book Tracking Service
//!
//! Tracks Binance order books for the configured trading pairs and serves
//! their state over a small HTTP status server.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use book_tracker::{BinanceDataSource, Config, OrderBookTracker, TrackerSettings};

/// Levels per side returned by `/status`
const STATUS_DEPTH: usize = 10;

/// Application state shared with the HTTP handlers
struct AppState {
    tracker: Arc<OrderBookTracker>,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting order book tracker");

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!(trading_pairs = ?config.trading_pairs, "Configuration loaded");

    let data_source = Arc::new(BinanceDataSource::new(config.as_ref().clone()));
    let tracker = Arc::new(OrderBookTracker::new(
        data_source,
        TrackerSettings::from(config.as_ref()),
    )?);
    tracker.start().await;

    match tracker.last_traded_prices().await {
        Ok(prices) => info!(prices = ?prices, "Last traded prices"),
        Err(e) => warn!(error = %e, "Could not fetch last traded prices"),
    }

    let state = Arc::new(AppState {
        tracker: tracker.clone(),
        config: config.clone(),
    });

    // Start status server
    let server_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_status_server(server_state).await {
            warn!(error = %e, "Status server error");
        }
    });

    // Periodic status logging
    let status_tracker = tracker.clone();
    tokio::spawn(async move {
        let mut status_interval = interval(Duration::from_secs(30));
        loop {
            status_interval.tick().await;
            for status in status_tracker.statuses(1).await {
                if let Some(mid) = status.metrics.mid_price {
                    info!(
                        trading_pair = %status.trading_pair,
                        mid_price = %mid,
                        spread_bps = ?status.metrics.spread_bps,
                        imbalance = ?status.metrics.imbalance,
                        last_trade_price = ?status.last_trade_price,
                        "Order book status"
                    );
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    tracker.stop().await;

    Ok(())
}

/// Start HTTP server for health checks, book status and metrics
async fn start_status_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.status_port));
    info!(addr = %addr, "Starting status server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let ready = state.tracker.ready().await;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": if ready { "healthy" } else { "syncing" },
            "component": "book-tracker",
            "pairs": state.tracker.tracking_status().await,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "books": state.tracker.statuses(STATUS_DEPTH).await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = state.tracker.metrics().registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Metrics are not valid UTF-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
