//! Registry of connected build nodes.

use async_trait::async_trait;
use cachebuild_core::Result;
use cachebuild_core::bus::{NodeInfo, NodeRegistry};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::DbResult;

#[derive(Debug, Clone, sqlx::FromRow)]
struct NodeRow {
    id: String,
    arch: Vec<String>,
    capacity: i32,
    last_seen: DateTime<Utc>,
}

impl From<NodeRow> for NodeInfo {
    fn from(row: NodeRow) -> Self {
        NodeInfo {
            id: row.id,
            arch: row.arch,
            capacity: row.capacity.max(0) as u32,
            last_seen: row.last_seen,
        }
    }
}

/// PostgreSQL implementation of [`NodeRegistry`].
///
/// Nodes upsert their own row with an expiry; rows past `expires_at` are
/// treated as disconnected.
pub struct PgNodeRegistry {
    pool: PgPool,
}

impl PgNodeRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_live(&self) -> DbResult<Vec<NodeInfo>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, arch, capacity, last_seen FROM build_nodes WHERE expires_at > NOW() ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NodeInfo::from).collect())
    }

    async fn fetch_one(&self, id: &str) -> DbResult<Option<NodeInfo>> {
        let row = sqlx::query_as::<_, NodeRow>(
            "SELECT id, arch, capacity, last_seen FROM build_nodes WHERE id = $1 AND expires_at > NOW()",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(NodeInfo::from))
    }

    async fn delete(&self, id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM build_nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeRegistry for PgNodeRegistry {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.fetch_live().await?)
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>> {
        Ok(self.fetch_one(id).await?)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        Ok(self.delete(id).await?)
    }
}
