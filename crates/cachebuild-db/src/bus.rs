//! Message bus over PostgreSQL LISTEN/NOTIFY.
//!
//! Topics map one-to-one onto notification channels. Payloads are the JSON
//! encoding of [`BusMessage`], so they must stay under PostgreSQL's 8000 byte
//! notification limit; advertisements and claims are far smaller than that.

use async_trait::async_trait;
use cachebuild_core::bus::{BusMessage, MessageBus};
use cachebuild_core::{Error, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::debug;

pub struct PgMessageBus {
    pool: PgPool,
}

impl PgMessageBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageBus for PgMessageBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<()> {
        let payload =
            serde_json::to_string(message).map_err(|e| Error::Internal(e.to_string()))?;
        debug!(topic = %topic, kind = ?message.kind, "Publishing bus message");
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("publish to {}: {}", topic, e)))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Result<BusMessage>>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("connect listener: {}", e)))?;
        listener
            .listen(topic)
            .await
            .map_err(|e| Error::Internal(format!("listen on {}: {}", topic, e)))?;

        let stream = listener.into_stream().map(|item| match item {
            Ok(notification) => serde_json::from_str::<BusMessage>(notification.payload())
                .map_err(|e| Error::InvalidInput(format!("malformed bus message: {}", e))),
            Err(e) => Err(Error::Internal(format!("listener error: {}", e))),
        });
        Ok(stream.boxed())
    }
}
