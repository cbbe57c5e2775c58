//! Webhook trigger endpoint.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use cachebuild_core::configuration::TriggerMode;
use cachebuild_core::{ConfigId, Error};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::builds::{TriggerResponse, trigger};

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

pub fn router() -> Router<AppState> {
    Router::new().route("/{config_id}", post(webhook))
}

/// Trigger a webhook-mode configuration.
///
/// When the configuration has a secret the body must be signed with it.
async fn webhook(
    State(state): State<AppState>,
    Path(config_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let config_id = ConfigId::new(config_id);
    let config = state
        .scheduler
        .configuration(config_id)
        .await?
        .ok_or_else(|| Error::configuration_not_found(config_id))?;

    let TriggerMode::Webhook { secret } = &config.trigger else {
        return Err(ApiError::BadRequest(format!(
            "configuration {} is not triggered by webhooks",
            config_id
        )));
    };

    if let Some(secret) = secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!(config_id = %config_id, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    let run_id = trigger(&state, config_id).await?;
    info!(config_id = %config_id, run_id = %run_id, "Build triggered by webhook");
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { run_id })))
}

/// Verify a `sha256=<hex>` HMAC signature of `body`.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(sig_hex) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use axum::body::Body;
    use axum::http::Request;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn webhook_request(config_id: i64, body: &'static str, signature: Option<String>) -> Request<Body> {
        let builder = Request::post(format!("/webhooks/{}", config_id));
        let builder = match signature {
            Some(signature) => builder.header(SIGNATURE_HEADER, signature),
            None => builder,
        };
        builder.body(Body::from(body)).unwrap()
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let good = sign("secret", body);
        assert!(verify_signature("secret", body, Some(&good)));
        assert!(!verify_signature("other", body, Some(&good)));
        assert!(!verify_signature("secret", body, None));
        assert!(!verify_signature("secret", body, Some("sha256=zz")));
        assert!(!verify_signature("secret", body, Some(good.trim_start_matches("sha256="))));
    }

    #[tokio::test]
    async fn test_signed_webhook_triggers_build() {
        let app = TestApp::local().await;
        let body = r#"{"ref":"refs/heads/main"}"#;
        let signature = sign(WEBHOOK_SECRET, body.as_bytes());

        let response = app.send(webhook_request(2, body, Some(signature))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: TriggerResponse = json_body(response).await;
        assert!(app.store.runs().await.iter().any(|r| r.id == body.run_id));
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let app = TestApp::local().await;
        let signature = sign("not-the-secret", b"{}");

        let response = app.send(webhook_request(2, "{}", Some(signature))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.send(webhook_request(2, "{}", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(app.store.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsigned_webhook_without_secret() {
        let app = TestApp::local().await;
        let response = app.send(webhook_request(3, "{}", None)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_manual_configuration_rejects_webhooks() {
        let app = TestApp::local().await;
        let response = app.send(webhook_request(1, "{}", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_configuration() {
        let app = TestApp::local().await;
        let response = app.send(webhook_request(42, "{}", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
