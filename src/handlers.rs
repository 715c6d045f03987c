// handlers.rs
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::ApiError;
use crate::models::ActivePollView;
use crate::routes::AppState;
use crate::socket::serve_socket;

/// Liveness plus a database reachability check
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = if state.store.ping().await {
        format!("Connected to {}", state.store.backend())
    } else {
        "Database disconnected".to_string()
    };

    Json(json!({
        "message": "Polling System Backend is running!",
        "database": database,
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// The live poll and its current results
pub async fn active_poll(State(state): State<AppState>) -> Result<Json<ActivePollView>, ApiError> {
    Ok(Json(state.coordinator.active_poll().await?))
}

/// Recent polls from the store, or from process memory when the store is unreachable
pub async fn poll_history(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let limit = state.config.history_limit;

    match state.store.recent_polls(limit).await {
        Ok(history) => Ok(Json(json!({
            "total": history.len(),
            "history": history,
            "database": state.store.backend(),
        }))),
        Err(e) => {
            warn!("Error fetching poll history: {e}");
            let history = state.coordinator.history().await?;
            Ok(Json(json!({
                "total": history.len(),
                "history": history,
                "database": "In-memory fallback",
            })))
        }
    }
}

pub async fn socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state.coordinator))
}
