//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once the scheduler answers.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.scheduler.snapshot().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "configurations": snapshot.configurations,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}
