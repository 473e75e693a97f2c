//! HTTP handlers.

pub mod assets;
pub mod auth;
pub mod hunts;
pub mod intelligence;
pub mod sessions;

use axum::extract::State;
use axum::Json;

use super::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.manager.active_count(),
        "active_hunts": state.scheduler.active_count(),
    }))
}
