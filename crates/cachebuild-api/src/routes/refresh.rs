//! Configuration reload endpoint.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::auth::require_admin;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/refresh", post(refresh))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub configurations: usize,
}

async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let configurations = state.scheduler.refresh().await?;
    info!(configurations, "Configurations reloaded on request");
    Ok(Json(RefreshResponse { configurations }))
}
