//! Scheduler status endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use cachebuild_scheduler::SchedulerSnapshot;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

async fn status(State(state): State<AppState>) -> Result<Json<SchedulerSnapshot>, ApiError> {
    Ok(Json(state.scheduler.snapshot().await?))
}
