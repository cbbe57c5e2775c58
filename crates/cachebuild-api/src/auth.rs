//! Request credentials.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::AppState;
use crate::error::ApiError;

/// The token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests to administrative endpoints without the configured token.
///
/// When no token is configured every request is rejected.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized(
            "administrative endpoints are disabled".to_string(),
        ));
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Unauthorized("invalid or missing token".to_string())),
    }
}
