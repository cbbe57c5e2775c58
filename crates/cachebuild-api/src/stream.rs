//! Relays a live build session to an HTTP client.
//!
//! Every session message is written verbatim as one line of the response
//! body. A listener that falls too far behind gets a `lagged` status line in
//! place of the messages it missed. After the worker's final message, or once the session goes away,
//! the relay keeps going for a short grace period and then ends the body.

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use cachebuild_core::session::SessionMessage;
use cachebuild_scheduler::Subscription;
use futures::Stream;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CONTENT_TYPE: &str = "application/x-ndjson";

struct Relay {
    backlog: VecDeque<String>,
    receiver: broadcast::Receiver<String>,
    grace: Duration,
    deadline: Option<Instant>,
}

impl Relay {
    fn new(subscription: Subscription, grace: Duration) -> Self {
        Self {
            backlog: subscription.backlog.into(),
            receiver: subscription.receiver,
            grace,
            deadline: None,
        }
    }

    fn observe(&mut self, message: &str) {
        if self.deadline.is_none()
            && SessionMessage::parse(message).is_ok_and(|m| m.is_final())
        {
            self.deadline = Some(Instant::now() + self.grace);
        }
    }

    async fn next(&mut self) -> Option<String> {
        if let Some(message) = self.backlog.pop_front() {
            self.observe(&message);
            return Some(message);
        }

        loop {
            let received = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                        Ok(received) => received,
                        Err(_) => return None,
                    }
                }
                None => self.receiver.recv().await,
            };

            match received {
                Ok(message) => {
                    self.observe(&message);
                    return Some(message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Stream listener fell behind, messages dropped");
                    return Some(lagged_marker(skipped));
                }
                Err(RecvError::Closed) => {
                    debug!("Build session ended");
                    let deadline = self
                        .deadline
                        .unwrap_or_else(|| Instant::now() + self.grace);
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
            }
        }
    }

    fn into_stream(self) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut relay| async move {
            let message = relay.next().await?;
            Some((Ok(format!("{}\n", message)), relay))
        })
    }
}

/// Status line telling the client `skipped` messages were lost.
fn lagged_marker(skipped: u64) -> String {
    serde_json::json!({
        "type": "statusUpdate",
        "status": "lagged",
        "skipped": skipped,
    })
    .to_string()
}

/// A streaming response relaying `subscription`.
pub fn relay_response(subscription: Subscription, grace: Duration) -> Response {
    let body = Body::from_stream(Relay::new(subscription, grace).into_stream());
    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
