//! API routes.

pub mod builds;
pub mod health;
pub mod refresh;
pub mod status;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/builds", builds::router())
        .nest("/webhooks", webhooks::router())
        .merge(refresh::router())
        .merge(status::router())
        .merge(health::router())
        .with_state(state)
}
