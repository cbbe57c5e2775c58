//! In-memory backends.
//!
//! Used by the server's `--in-memory` development mode and by tests across the
//! workspace. Everything lives behind async locks and disappears with the
//! process.

use async_trait::async_trait;
use cachebuild_core::auth::AccessOracle;
use cachebuild_core::bus::{BusMessage, MessageBus, NodeInfo, NodeRegistry};
use cachebuild_core::configuration::BuildConfiguration;
use cachebuild_core::run::{RunRecord, RunStatus, RunUpdate};
use cachebuild_core::store::{CacheRecord, JobStore};
use cachebuild_core::{CacheId, ConfigId, Error, Result, RunId};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Contents loaded into the in-memory backends at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Seed {
    pub caches: Vec<CacheRecord>,
    pub configurations: Vec<BuildConfiguration>,
    pub grants: Vec<SeedGrant>,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedGrant {
    pub cache_id: CacheId,
    pub token: String,
}

impl Seed {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidInput(format!("seed file: {}", e)))
    }
}

#[derive(Default)]
struct StoreState {
    caches: BTreeMap<CacheId, CacheRecord>,
    configurations: BTreeMap<ConfigId, BuildConfiguration>,
    runs: BTreeMap<RunId, RunRecord>,
    next_run: i64,
}

/// In-memory implementation of [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<StoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: &Seed) -> Self {
        let state = StoreState {
            caches: seed.caches.iter().map(|c| (c.id, c.clone())).collect(),
            configurations: seed
                .configurations
                .iter()
                .map(|c| (c.id, c.clone()))
                .collect(),
            ..Default::default()
        };
        Self {
            state: RwLock::new(state),
        }
    }

    pub async fn insert_cache(&self, cache: CacheRecord) {
        self.state.write().await.caches.insert(cache.id, cache);
    }

    pub async fn insert_configuration(&self, config: BuildConfiguration) {
        self.state
            .write()
            .await
            .configurations
            .insert(config.id, config);
    }

    pub async fn remove_configuration(&self, id: ConfigId) {
        self.state.write().await.configurations.remove(&id);
    }

    /// Snapshot of every run record, ordered by id.
    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.read().await.runs.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_run(&self, config_id: ConfigId, status: RunStatus) -> Result<RunId> {
        let mut state = self.state.write().await;
        state.next_run += 1;
        let id = RunId::new(state.next_run);
        state.runs.insert(
            id,
            RunRecord {
                id,
                config_id,
                status,
                started_at: None,
                ended_at: None,
                duration_ms: None,
                log: String::new(),
                revision: None,
            },
        );
        Ok(id)
    }

    async fn update_run(&self, id: RunId, update: &RunUpdate) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("run {}", id)))?;
        update.apply(record);
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.state.read().await.runs.get(&id).cloned())
    }

    async fn list_configurations(&self) -> Result<Vec<BuildConfiguration>> {
        Ok(self
            .state
            .read()
            .await
            .configurations
            .values()
            .cloned()
            .collect())
    }

    async fn get_configuration(&self, id: ConfigId) -> Result<Option<BuildConfiguration>> {
        Ok(self.state.read().await.configurations.get(&id).cloned())
    }

    async fn get_cache(&self, id: CacheId) -> Result<Option<CacheRecord>> {
        Ok(self.state.read().await.caches.get(&id).cloned())
    }
}

/// In-memory implementation of [`AccessOracle`] holding plain-text grants.
#[derive(Default)]
pub struct MemoryAccessOracle {
    grants: RwLock<HashMap<CacheId, HashSet<String>>>,
}

impl MemoryAccessOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: &Seed) -> Self {
        let mut grants: HashMap<CacheId, HashSet<String>> = HashMap::new();
        for grant in &seed.grants {
            grants
                .entry(grant.cache_id)
                .or_default()
                .insert(grant.token.clone());
        }
        Self {
            grants: RwLock::new(grants),
        }
    }

    pub async fn grant(&self, cache_id: CacheId, token: &str) {
        self.grants
            .write()
            .await
            .entry(cache_id)
            .or_default()
            .insert(token.to_string());
    }
}

#[async_trait]
impl AccessOracle for MemoryAccessOracle {
    async fn is_authorized(&self, cache_id: CacheId, credential: Option<&str>) -> Result<bool> {
        let Some(token) = credential else {
            return Ok(false);
        };
        Ok(self
            .grants
            .read()
            .await
            .get(&cache_id)
            .is_some_and(|tokens| tokens.contains(token)))
    }
}

/// In-memory implementation of [`NodeRegistry`].
#[derive(Default)]
pub struct MemoryNodeRegistry {
    nodes: RwLock<BTreeMap<String, NodeInfo>>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: &Seed) -> Self {
        Self {
            nodes: RwLock::new(seed.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect()),
        }
    }

    pub async fn register(&self, node: NodeInfo) {
        self.nodes.write().await.insert(node.id.clone(), node);
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.nodes.write().await.remove(id);
        Ok(())
    }
}

const TOPIC_CAPACITY: usize = 256;

/// In-process [`MessageBus`] built on broadcast channels.
#[derive(Default)]
pub struct MemoryMessageBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl MemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<()> {
        // No subscribers is not an error for pub/sub.
        let _ = self.sender(topic).await.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Result<BusMessage>>> {
        let rx = self.sender(topic).await.subscribe();
        let topic = topic.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let topic = topic.clone();
            async move {
                match item {
                    Ok(message) => Some(Ok(message)),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Bus subscriber lagged");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
