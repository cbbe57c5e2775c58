//! Message bus payloads and the pub/sub collaborator traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{ConfigId, Result, RunId};

/// Topic carrying job advertisements, claims and node deregistrations.
pub const NODE_CONTROL_TOPIC: &str = "node-control";
/// Alternative per-run channel for unicast claim confirmations.
pub const BUILD_OUTPUT_TOPIC: &str = "build-output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMessageType {
    Queue,
    Claim,
    Deregister,
}

/// Envelope for every message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: BusMessageType,
    /// Identity of the publisher (controller instance or node id).
    pub sender: String,
    /// Node the message is meant for; `None` broadcasts to every node.
    pub target: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of a `queue` advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAdvertisement {
    pub job: RunId,
    pub builder_id: ConfigId,
    pub arch: String,
}

/// Outcome carried by a claim confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimResult {
    Approved,
}

/// Payload of a `claim` message.
///
/// Nodes send it without a result to ask for a job; the controller answers
/// with `result` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobClaim {
    pub job: RunId,
    pub builder_id: ConfigId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ClaimResult>,
}

impl BusMessage {
    pub fn advertisement(sender: &str, ad: &JobAdvertisement) -> Result<Self> {
        Ok(Self {
            kind: BusMessageType::Queue,
            sender: sender.to_string(),
            target: None,
            data: serde_json::to_value(ad)
                .map_err(|e| crate::Error::Internal(e.to_string()))?,
        })
    }

    pub fn claim(sender: &str, target: &str, claim: &JobClaim) -> Result<Self> {
        Ok(Self {
            kind: BusMessageType::Claim,
            sender: sender.to_string(),
            target: Some(target.to_string()),
            data: serde_json::to_value(claim)
                .map_err(|e| crate::Error::Internal(e.to_string()))?,
        })
    }

    /// Decode the payload as `T`.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| crate::Error::InvalidInput(format!("bad {:?} payload: {}", self.kind, e)))
    }
}

/// A connected build node, as advertised in the node registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    /// Execution architectures the node can build for.
    pub arch: Vec<String>,
    /// Number of builds the node runs at once.
    pub capacity: u32,
    pub last_seen: DateTime<Utc>,
}

impl NodeInfo {
    pub fn supports(&self, arch: &str) -> bool {
        self.arch.iter().any(|a| a == arch)
    }
}

/// A pub/sub channel between the controller and build nodes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message on a topic.
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<()>;

    /// Subscribe to a topic.
    ///
    /// Payloads that are not valid [`BusMessage`]s are yielded as errors.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Result<BusMessage>>>;
}

/// Registry of currently connected build nodes.
///
/// Nodes register themselves; the orchestrator reads the registry and only
/// removes entries when a node deregisters explicitly.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>>;

    async fn deregister(&self, id: &str) -> Result<()>;
}
