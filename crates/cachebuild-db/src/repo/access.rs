//! Cache access checks against issued API keys.

use async_trait::async_trait;
use cachebuild_core::auth::AccessOracle;
use cachebuild_core::{CacheId, Result};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::DbResult;

/// Hex-encoded SHA-256 digest of an API key, as stored in `cache_access`.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// PostgreSQL implementation of [`AccessOracle`].
pub struct PgAccessOracle {
    pool: PgPool,
}

impl PgAccessOracle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn has_grant(&self, cache_id: CacheId, token: &str) -> DbResult<bool> {
        let granted = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM cache_access WHERE cache_id = $1 AND token_sha256 = $2)",
        )
        .bind(cache_id.get())
        .bind(token_digest(token))
        .fetch_one(&self.pool)
        .await?;
        Ok(granted)
    }
}

#[async_trait]
impl AccessOracle for PgAccessOracle {
    async fn is_authorized(&self, cache_id: CacheId, credential: Option<&str>) -> Result<bool> {
        let Some(token) = credential.filter(|t| !t.is_empty()) else {
            return Ok(false);
        };
        Ok(self.has_grant(cache_id, token).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_digest_is_hex_sha256() {
        assert_eq!(
            token_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
