// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! EEW Dispatcher Core - real-time bus-to-WebSocket fanout for earthquake
//! early-warning waveforms, picks, and EEW alerts.
//!
//! The dispatcher tails a Redis Streams bus for live waveform, pick, and
//! EEW data, runs it through a signal-processing pipeline, and fans it out
//! to subscribed WebSocket clients with per-client downsampling and
//! backpressure. Clients can also request a historical replay of recent
//! data over the same connection.
//!
//! # Usage
//!
//! ```bash
//! # Start the dispatcher against a local Redis instance
//! eew-dispatcher --redis-host 127.0.0.1 --port 5001
//! ```
//!
//! # Protocol
//!
//! See `protocol.rs` for the exact WebSocket event shapes.

mod bus;
mod config;
mod dispatcher;
mod error;
mod fanout;
mod historical;
mod pick_dedup;
mod protocol;
mod reader;
mod session;
mod signal;
mod subscription;
mod types;
mod window;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use bus::{Bus, RedisBus};
use clap::Parser;
use config::Args;
use dispatcher::Dispatcher;
use error::DispatcherError;
use session::ClientSession;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), DispatcherError> {
    if let Some(path) = std::env::args().collect::<Vec<_>>().windows(2).find_map(|w| {
        (w[0] == "--config").then(|| w[1].clone())
    }) {
        config::apply_config_file(&path)?;
    }
    let args = Args::parse();

    let filter = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .init();

    info!("EEW Dispatcher Core v{}", env!("CARGO_PKG_VERSION"));

    let calibration = config::load_calibration_table(&args.calibration_path);
    info!("loaded {} calibration entries", calibration.len());

    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&args.redis_url()).await?);
    let addr = args.bind_addr();

    let dispatcher = Arc::new(Dispatcher::new(args, calibration, bus));
    dispatcher.spawn_readers();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher);

    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, dispatcher: Arc<Dispatcher>) {
    let session = ClientSession::new(dispatcher);
    if let Err(e) = session.run(socket).await {
        error!("session error: {e}");
    }
}

async fn health_handler(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    use std::sync::atomic::Ordering;

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": dispatcher.fanout.client_count(),
        "stations_buffered": dispatcher.window_store.station_count(),
        "messages_received": dispatcher.reader_stats.messages_received.load(Ordering::Relaxed),
        "malformed_dropped": dispatcher.reader_stats.malformed_dropped.load(Ordering::Relaxed),
        "bus_errors": dispatcher.reader_stats.bus_errors.load(Ordering::Relaxed),
    }))
}
