//! Container runtime trait and process types.
//!
//! Build workers run as isolated processes (containers) started by a runtime
//! such as Docker. The scheduler only needs to start them, find their network
//! address, hear about their lifecycle, and tear them down.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ConfigId, Result, RunId};

/// Label carrying the configuration id of a builder process.
pub const CONFIG_LABEL: &str = "cachebuild.config";
/// Label carrying the run id of a builder process.
pub const RUN_LABEL: &str = "cachebuild.run";

/// Specification for a worker process to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Image to run.
    pub image: String,
    /// Process name; encodes the configuration/run pair (see [`WorkerName`]).
    pub name: String,
    /// Labels attached to the process.
    pub labels: HashMap<String, String>,
    /// Network to attach the process to.
    pub network: Option<String>,
}

/// What the runtime knows about a running process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Host or IP the process can be reached on.
    pub address: Option<String>,
}

/// A container lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Start,
    Stop,
}

/// A lifecycle notification from the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub action: LifecycleAction,
    pub process_id: String,
    pub name: String,
}

/// The configuration/run pair encoded in a builder process name.
///
/// Names look like `<prefix>-<config id>-<run id>`. Anything else is not a
/// builder worker and its events are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerName {
    pub config_id: ConfigId,
    pub run_id: RunId,
}

impl WorkerName {
    pub fn new(config_id: ConfigId, run_id: RunId) -> Self {
        Self { config_id, run_id }
    }

    pub fn format(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.config_id, self.run_id)
    }

    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        // Docker reports names with a leading slash in some APIs.
        let name = name.strip_prefix('/').unwrap_or(name);
        let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
        let (config, run) = rest.split_once('-')?;
        Some(Self {
            config_id: config.parse().ok()?,
            run_id: run.parse().ok()?,
        })
    }

    /// Labels identifying this worker.
    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            (CONFIG_LABEL.to_string(), self.config_id.to_string()),
            (RUN_LABEL.to_string(), self.run_id.to_string()),
        ])
    }
}

/// Trait for container runtimes hosting build workers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Name of this runtime.
    fn name(&self) -> &'static str;

    /// Start a process and return its runtime id.
    async fn run_process(&self, spec: &ProcessSpec) -> Result<String>;

    /// Inspect a running process.
    async fn inspect(&self, process_id: &str) -> Result<ProcessInfo>;

    /// Subscribe to lifecycle events for all processes.
    ///
    /// Items that cannot be understood are yielded as errors so the consumer
    /// can log and skip them without losing the subscription.
    async fn lifecycle_events(&self) -> Result<BoxStream<'static, Result<LifecycleEvent>>>;

    /// Forcibly terminate a process.
    async fn kill(&self, process_id: &str) -> Result<()>;

    /// Remove a terminated process.
    async fn remove(&self, process_id: &str) -> Result<()>;
}
