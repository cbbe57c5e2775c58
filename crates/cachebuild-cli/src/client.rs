//! HTTP client for the cachebuild server.

use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(api_url).with_context(|| format!("invalid API URL {}", api_url))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
        })
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("building URL for {}", path))
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let request = self.http.request(method, self.url(path)?);
        Ok(match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    /// Send a request and fail on a non-success status.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.context("request failed")?;
        let status = response.status();
        debug!(url = %response.url(), %status, "Server responded");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        bail!("{}: {}", status, message)
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        response.json().await.context("decoding response")
    }
}
