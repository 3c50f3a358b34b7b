//! CoachCall Server
//!
//! Relays call signaling between the trainer and trainee of a session and
//! stores the recordings each side uploads when a call ends.

pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::relay::SignalingRelay;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<SignalingRelay>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let relay = SignalingRelay::new(config.limits.session_backlog);
        Self {
            config: Arc::new(config),
            relay: Arc::new(relay),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.limits.upload_body_limit();

    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Recordings
        .route(
            "/api/v1/recordings/upload",
            post(handlers::recordings::upload_recording).layer(DefaultBodyLimit::max(body_limit)),
        )

        // WebSocket for signaling
        .route("/ws", get(handlers::websocket::websocket_handler))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}
