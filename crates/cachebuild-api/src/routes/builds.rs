//! Build trigger, kill and log stream endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use cachebuild_core::run::{RunStatus, RunUpdate};
use cachebuild_core::{ConfigId, Error, RunId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::AppState;
use crate::auth::{bearer_token, require_admin};
use crate::error::ApiError;
use crate::stream::relay_response;

pub fn router() -> Router<AppState> {
    // The segment is a configuration id for POST/DELETE and a run id for the
    // stream; the router needs one parameter name per position.
    Router::new()
        .route("/{id}", post(trigger_build).delete(kill_build))
        .route("/{id}/stream", get(stream_build))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub run_id: RunId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillResponse {
    pub killed: Vec<RunId>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    token: Option<String>,
}

/// Admit a run of a configuration.
///
/// Locally the scheduler queues it. In remote mode a `QUEUED` record is
/// created and advertised to build nodes; when no node can take it the record
/// is failed.
pub(crate) async fn trigger(state: &AppState, config_id: ConfigId) -> Result<RunId, ApiError> {
    let Some(coordinator) = &state.coordinator else {
        return Ok(state.scheduler.enqueue(config_id).await?);
    };

    if state.scheduler.configuration(config_id).await?.is_none() {
        return Err(Error::configuration_not_found(config_id).into());
    }
    let run_id = state
        .store
        .create_run(config_id, RunStatus::Queued)
        .await?;

    if let Err(e) = coordinator.advertise(run_id, config_id).await {
        warn!(run_id = %run_id, config_id = %config_id, error = %e, "Advertisement failed");
        let update = RunUpdate::finished(
            RunStatus::Failure,
            format!("[cachebuild] {}\n", e),
            None,
            Utc::now(),
        );
        if let Err(flush) = state.store.update_run(run_id, &update).await {
            error!(run_id = %run_id, error = %flush, "Failed to record advertisement failure");
        }
        return Err(e.into());
    }
    Ok(run_id)
}

async fn trigger_build(
    State(state): State<AppState>,
    Path(config_id): Path<i64>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let config_id = ConfigId::new(config_id);
    let run_id = trigger(&state, config_id).await?;
    info!(config_id = %config_id, run_id = %run_id, "Build triggered");
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { run_id })))
}

async fn kill_build(
    State(state): State<AppState>,
    Path(config_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<KillResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let killed = state.scheduler.kill(ConfigId::new(config_id)).await?;
    Ok(Json(KillResponse { killed }))
}

/// Relay a run's live session as newline-delimited JSON.
///
/// The caller must be authorized for the cache owning the run's
/// configuration. The credential is a bearer token, or a `token` query
/// parameter for clients that cannot set headers.
async fn stream_build(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let run_id = RunId::new(run_id);
    let run = state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {}", run_id)))?;
    let config = state
        .store
        .get_configuration(run.config_id)
        .await?
        .ok_or_else(|| Error::configuration_not_found(run.config_id))?;
    let cache = state
        .store
        .get_cache(config.cache_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cache {}", config.cache_id)))?;

    let credential = bearer_token(&headers).or(params.token.as_deref());
    if !state.oracle.is_authorized(cache.id, credential).await? {
        warn!(run_id = %run_id, cache_id = %cache.id, "Unauthorized stream request");
        return Err(ApiError::Unauthorized(format!(
            "no access to cache {}",
            cache.name
        )));
    }

    let subscription = state.scheduler.subscribe(run_id).await?;
    info!(run_id = %run_id, backlog = subscription.backlog.len(), "Streaming build output");
    Ok(relay_response(subscription, state.stream.grace))
}
