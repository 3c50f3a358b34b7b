use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.relay.connection_count(),
        "onlineUsers": state.relay.online_user_count(),
        "activeSessions": state.relay.active_session_count(),
    }))
}
