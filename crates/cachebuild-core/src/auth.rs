//! Authorization oracle.

use async_trait::async_trait;

use crate::{CacheId, Result};

/// Decides whether a credential grants access to a cache.
///
/// Key issuance and verification belong to the surrounding platform; the
/// orchestrator only asks yes/no questions.
#[async_trait]
pub trait AccessOracle: Send + Sync {
    async fn is_authorized(&self, cache_id: CacheId, credential: Option<&str>) -> Result<bool>;
}
