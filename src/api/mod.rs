//! HTTP surface for the carnival games.
//!
//! ## Endpoints
//!
//! - `POST /api/predict` - Adversarial MNIST: `{"points": "(1,2), (3,4)"}` → `{"prediction": 3}`
//! - `POST /coordinates` - Feature hunt: `{"word": "water"}` → `{"coordinates": [x, y], "scalar": s}`
//! - `POST /api/steer` - Surgery sim: `{"knob_turns": "1.0, 0.5"}` → `{"prediction": "lebron"}`
//! - `GET /health` - Liveness and loaded games

pub mod dto;
pub mod error;
pub mod handlers;
pub mod state;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use dto::*;
pub use error::{ApiError, ErrorResponse};
pub use state::AppState;

pub const DEFAULT_PORT: u16 = 4167;

/// Build the router with every game route.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/predict", post(handlers::predict_digit))
        .route("/coordinates", post(handlers::coordinates))
        .route("/api/steer", post(handlers::steer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let games = state.games();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        "Listening on {addr} (digit: {}, coordinates: {}, steer: {})",
        games.digit, games.coordinates, games.steer
    );

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
    }
}
