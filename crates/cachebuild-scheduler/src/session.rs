//! Build session protocol client.
//!
//! The scheduler opens one websocket per worker, sends the [`SessionConfig`]
//! and then reads session messages until the worker closes the socket. The
//! connection is abstracted behind [`SessionConnector`] so tests can drive a
//! session without a network.

use async_trait::async_trait;
use cachebuild_core::session::SessionConfig;
use cachebuild_core::{Error, Result, RunId};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::scheduler::Event;

/// Bounded retry with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// The final error is reported as a `ProtocolFailure`.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    return Err(Error::ProtocolFailure(format!(
                        "giving up after {} attempts: {}",
                        attempts, e
                    )));
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Attempt failed, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// An open session socket.
#[async_trait]
pub trait SessionTransport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text message; `None` once the socket is closed.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Opens session sockets to workers.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn SessionTransport>>;
}

/// Websocket connector used against real workers.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl SessionConnector for WsConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn SessionTransport>> {
        let url = format!("ws://{}/", address);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ProtocolFailure(format!("connect {}: {}", url, e)))?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::ProtocolFailure(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| Error::ProtocolFailure(e.to_string())),
                    );
                }
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(Error::ProtocolFailure(e.to_string()))),
            }
        }
    }
}

/// Outcome of a session, reported to the scheduler.
#[derive(Debug)]
pub enum SessionEvent {
    /// Configuration delivered; the worker is streaming.
    Established,
    /// One raw message from the worker.
    Message(String),
    /// The socket closed.
    Closed,
    /// The handshake could not be completed.
    Failed(Error),
}

/// Connect to a worker, hand it its configuration and pump its messages.
pub(crate) async fn drive(
    connector: Arc<dyn SessionConnector>,
    policy: RetryPolicy,
    run_id: RunId,
    address: String,
    config: SessionConfig,
    events: mpsc::Sender<Event>,
) {
    let payload = match serde_json::to_string(&config) {
        Ok(payload) => payload,
        Err(e) => {
            let _ = events
                .send(Event::session(run_id, SessionEvent::Failed(Error::Internal(e.to_string()))))
                .await;
            return;
        }
    };

    let handshake = policy
        .run(|attempt| {
            let connector = connector.clone();
            let address = address.clone();
            let payload = payload.clone();
            async move {
                debug!(run_id = %run_id, attempt, address = %address, "Opening build session");
                let mut transport = connector.connect(&address).await?;
                transport.send(payload).await?;
                Ok(transport)
            }
        })
        .await;

    let mut transport = match handshake {
        Ok(transport) => transport,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Build session handshake failed");
            let _ = events.send(Event::session(run_id, SessionEvent::Failed(e))).await;
            return;
        }
    };

    info!(run_id = %run_id, address = %address, "Build session established");
    if events
        .send(Event::session(run_id, SessionEvent::Established))
        .await
        .is_err()
    {
        return;
    }

    while let Some(item) = transport.recv().await {
        match item {
            Ok(text) => {
                if events
                    .send(Event::session(run_id, SessionEvent::Message(text)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Build session read error");
                break;
            }
        }
    }

    debug!(run_id = %run_id, "Build session closed");
    let _ = events.send(Event::session(run_id, SessionEvent::Closed)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_succeeds_after_failures() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::ProtocolFailure("refused".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_gives_up() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::ProtocolFailure("refused".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::ProtocolFailure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_secs(60));
        assert_eq!(policy.attempts(), 1);

        let result: Result<()> = policy
            .run(|attempt| async move {
                assert_eq!(attempt, 1);
                Err(Error::ProtocolFailure("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
    }
}
