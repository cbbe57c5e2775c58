//! Remote dispatch over the message bus.
//!
//! In remote mode the controller does not start workers itself. It
//! advertises queued runs on the node-control topic; build nodes answer with
//! claim requests and the controller approves one claim per run. Runs held
//! by a node that deregisters are failed.

use cachebuild_core::bus::{
    BusMessage, BusMessageType, ClaimResult, JobAdvertisement, JobClaim, MessageBus,
    NODE_CONTROL_TOPIC, NodeRegistry,
};
use cachebuild_core::run::{RunStatus, RunUpdate};
use cachebuild_core::store::JobStore;
use cachebuild_core::{ConfigId, Error, Result, RunId};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Controller side of the advertise/claim exchange.
pub struct Coordinator {
    id: String,
    store: Arc<dyn JobStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn NodeRegistry>,
    confirm_topic: String,
    /// Approved runs by the node holding them.
    claims: Mutex<HashMap<RunId, String>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        Self {
            id: format!("controller-{}", Uuid::now_v7()),
            store,
            bus,
            registry,
            confirm_topic: NODE_CONTROL_TOPIC.to_string(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Publish claim confirmations on another topic, e.g. `build-output`.
    pub fn with_confirm_topic(mut self, topic: impl Into<String>) -> Self {
        self.confirm_topic = topic.into();
        self
    }

    /// Identity used as `sender` on every message this controller publishes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Broadcast a queued run to every node.
    ///
    /// Fails with `NoCapableNode` when no registered node builds for the
    /// configuration's architecture. The run record is left untouched.
    pub async fn advertise(&self, run_id: RunId, config_id: ConfigId) -> Result<()> {
        let config = self
            .store
            .get_configuration(config_id)
            .await?
            .ok_or_else(|| Error::configuration_not_found(config_id))?;

        let nodes = self.registry.list_nodes().await?;
        if !nodes.iter().any(|n| n.supports(&config.arch)) {
            return Err(Error::NoCapableNode(format!(
                "no connected node builds for {}",
                config.arch
            )));
        }

        let message = BusMessage::advertisement(
            &self.id,
            &JobAdvertisement {
                job: run_id,
                builder_id: config_id,
                arch: config.arch.clone(),
            },
        )?;
        self.bus.publish(NODE_CONTROL_TOPIC, &message).await?;
        info!(run_id = %run_id, config_id = %config_id, arch = %config.arch, "Build advertised");
        Ok(())
    }

    /// Approve a node's claim on a run.
    pub async fn claim(&self, node_id: &str, run_id: RunId, config_id: ConfigId) -> Result<()> {
        let message = BusMessage::claim(
            &self.id,
            node_id,
            &JobClaim {
                job: run_id,
                builder_id: config_id,
                result: Some(ClaimResult::Approved),
            },
        )?;
        self.bus.publish(&self.confirm_topic, &message).await?;
        info!(run_id = %run_id, node = %node_id, "Claim approved");
        Ok(())
    }

    /// Answer node messages until the subscription ends.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut messages = self.bus.subscribe(NODE_CONTROL_TOPIC).await?;
        info!(controller = %self.id, "Listening for build node messages");

        while let Some(item) = messages.next().await {
            match item {
                Ok(message) => {
                    if let Err(e) = self.handle_message(message).await {
                        warn!(error = %e, "Failed to handle node message");
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed node message"),
            }
        }

        warn!("Node control subscription ended");
        Ok(())
    }

    async fn handle_message(&self, message: BusMessage) -> Result<()> {
        if message.sender == self.id {
            return Ok(());
        }

        match message.kind {
            BusMessageType::Claim => {
                let claim: JobClaim = message.payload()?;
                // Confirmations, ours or another controller's.
                if claim.result.is_some() {
                    return Ok(());
                }
                self.handle_claim(&message.sender, claim).await
            }
            BusMessageType::Deregister => {
                info!(node = %message.sender, "Build node deregistered");
                self.registry.deregister(&message.sender).await?;
                self.release_claims(&message.sender).await
            }
            BusMessageType::Queue => {
                debug!(sender = %message.sender, "Ignoring advertisement from another controller");
                Ok(())
            }
        }
    }

    async fn handle_claim(&self, node_id: &str, claim: JobClaim) -> Result<()> {
        if self.registry.get_node(node_id).await?.is_none() {
            warn!(node = %node_id, run_id = %claim.job, "Claim from unregistered node");
            return Ok(());
        }
        if self.store.get_configuration(claim.builder_id).await?.is_none() {
            warn!(config_id = %claim.builder_id, run_id = %claim.job, "Claim for unknown configuration");
            return Ok(());
        }
        let Some(run) = self.store.get_run(claim.job).await? else {
            warn!(run_id = %claim.job, "Claim for unknown run");
            return Ok(());
        };
        if run.config_id != claim.builder_id || run.status != RunStatus::Queued {
            // Already claimed by someone else, or not the run that was advertised.
            debug!(run_id = %claim.job, status = %run.status, node = %node_id, "Rejecting claim");
            return Ok(());
        }

        self.claim(node_id, claim.job, claim.builder_id).await?;
        self.store
            .update_run(claim.job, &RunUpdate::started(Utc::now()))
            .await?;
        self.lock_claims().insert(claim.job, node_id.to_string());
        Ok(())
    }

    /// Fail the runs a departed node still held.
    async fn release_claims(&self, node_id: &str) -> Result<()> {
        let held: Vec<RunId> = {
            let mut claims = self.lock_claims();
            let held: Vec<RunId> = claims
                .iter()
                .filter(|(_, holder)| holder.as_str() == node_id)
                .map(|(run_id, _)| *run_id)
                .collect();
            for run_id in &held {
                claims.remove(run_id);
            }
            held
        };

        for run_id in held {
            let Some(run) = self.store.get_run(run_id).await? else {
                continue;
            };
            if run.status != RunStatus::Running {
                continue;
            }
            warn!(run_id = %run_id, node = %node_id, "Failing run held by deregistered node");
            let mut log = run.log;
            log.push_str(&format!(
                "[cachebuild] build node {} deregistered before the run finished\n",
                node_id
            ));
            let update = RunUpdate::finished(RunStatus::Failure, log, run.started_at, Utc::now());
            self.store.update_run(run_id, &update).await?;
        }
        Ok(())
    }

    fn lock_claims(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, String>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }
}
