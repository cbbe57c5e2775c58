//! Job store abstraction.
//!
//! The relational store that owns caches, build configurations and run
//! records lives outside this system; the orchestrator only needs the narrow
//! slice of it described here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::configuration::BuildConfiguration;
use crate::run::{RunRecord, RunStatus, RunUpdate};
use crate::{CacheId, ConfigId, Result, RunId};

/// A binary cache, as far as the orchestrator cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub id: CacheId,
    pub name: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a run record for a configuration and return its id.
    async fn create_run(&self, config_id: ConfigId, status: RunStatus) -> Result<RunId>;

    /// Write a state transition for a run.
    async fn update_run(&self, id: RunId, update: &RunUpdate) -> Result<()>;

    /// Get a run record.
    async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>>;

    /// List every build configuration.
    async fn list_configurations(&self) -> Result<Vec<BuildConfiguration>>;

    /// Get a single build configuration.
    async fn get_configuration(&self, id: ConfigId) -> Result<Option<BuildConfiguration>>;

    /// Get a cache.
    async fn get_cache(&self, id: CacheId) -> Result<Option<CacheRecord>>;
}
