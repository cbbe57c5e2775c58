//! Build configuration definitions.

use serde::{Deserialize, Serialize};

use crate::{CacheId, ConfigId};

/// Description of one buildable unit, as loaded from the job store.
///
/// A configuration is never mutated while a run of it is in flight: a refresh
/// replaces the scheduler's copy, and runs that already started keep the
/// payload they were handed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfiguration {
    /// Unique identifier.
    pub id: ConfigId,
    /// Human readable name.
    pub name: String,
    /// Cache that owns this configuration and receives its artifacts.
    pub cache_id: CacheId,
    /// Execution architecture a node needs to build this (e.g. "x86_64-linux").
    pub arch: String,
    /// Whether several runs may execute at the same time.
    pub allow_parallel: bool,
    /// Where the sources come from.
    pub source: SourceSpec,
    /// How the build is invoked.
    pub invocation: BuildInvocation,
    /// Where the build results are pushed.
    pub push: PushTarget,
    /// What may start a run.
    pub trigger: TriggerMode,
}

/// Source-fetch parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceSpec {
    /// The build command fetches everything it needs itself.
    None,
    /// Clone a git repository before building.
    #[serde(rename_all = "camelCase")]
    Git {
        repository: String,
        branch: Option<String>,
        credentials: Option<GitCredentials>,
    },
}

/// Credentials for fetching a private repository.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCredentials {
    pub username: Option<String>,
    pub token: String,
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCredentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Build invocation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInvocation {
    /// Command run inside the worker (e.g. `nix build .#default`).
    pub command: String,
    /// Extra substituters consulted during the build.
    #[serde(default)]
    pub substituters: Vec<String>,
    /// Public keys trusted for the substituters.
    #[serde(default)]
    pub trusted_public_keys: Vec<String>,
    /// Maximum number of concurrent build jobs inside the worker.
    #[serde(default)]
    pub max_jobs: Option<u32>,
    /// Cores available to each build job.
    #[serde(default)]
    pub cores: Option<u32>,
}

/// Artifact-push target.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTarget {
    /// Address of the destination cache.
    pub cache_url: String,
    /// Credential used to push.
    pub token: String,
}

impl std::fmt::Debug for PushTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushTarget")
            .field("cache_url", &self.cache_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// What may start a run of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum TriggerMode {
    /// Manual trigger only.
    Manual,
    /// Started by an external scheduler on the given cron expression.
    Scheduled { cron: String },
    /// Started by a webhook; requests are signed with `secret` when present.
    Webhook { secret: Option<String> },
}

impl TriggerMode {
    pub fn is_webhook(&self) -> bool {
        matches!(self, TriggerMode::Webhook { .. })
    }
}
