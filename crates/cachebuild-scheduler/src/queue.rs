//! FIFO admission queue with per-configuration exclusivity.

use cachebuild_core::configuration::BuildConfiguration;
use cachebuild_core::run::RunStatus;
use cachebuild_core::store::JobStore;
use cachebuild_core::{ConfigId, Error, Result, RunId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// A run waiting for a free worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub config_id: ConfigId,
    pub run_id: RunId,
}

/// Queue of admitted runs.
///
/// Owned by the scheduler; callers outside it only ever reach `enqueue`
/// through the scheduler handle.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    entries: VecDeque<QueueEntry>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            entries: VecDeque::new(),
        }
    }

    /// Admit a run of `config_id`.
    ///
    /// `running` reports whether a live worker exists for a configuration.
    /// A non-parallel configuration with a live worker is rejected with
    /// `Conflict` before any run record is created.
    pub async fn enqueue(
        &mut self,
        configurations: &HashMap<ConfigId, BuildConfiguration>,
        config_id: ConfigId,
        running: impl Fn(ConfigId) -> bool,
    ) -> Result<RunId> {
        let config = configurations
            .get(&config_id)
            .ok_or_else(|| Error::configuration_not_found(config_id))?;

        if !config.allow_parallel && running(config_id) {
            return Err(Error::Conflict(format!(
                "configuration {} is already running",
                config_id
            )));
        }

        let run_id = self.store.create_run(config_id, RunStatus::Queued).await?;
        self.entries.push_back(QueueEntry { config_id, run_id });
        info!(config_id = %config_id, run_id = %run_id, queued = self.entries.len(), "Build queued");
        Ok(run_id)
    }

    /// Pick up to `available` entries for dispatch, in arrival order.
    ///
    /// Parallelism is read from `configurations` as it is now, not as it was
    /// when the entry was admitted; an entry whose configuration is gone is
    /// treated as non-parallel. Entries of a non-parallel configuration that
    /// is running (per `running`) or already picked in this batch are skipped
    /// and moved to the tail, behind the entries that were not visited,
    /// keeping their relative order.
    pub fn drain(
        &mut self,
        available: usize,
        configurations: &HashMap<ConfigId, BuildConfiguration>,
        running: impl Fn(ConfigId) -> bool,
    ) -> Vec<QueueEntry> {
        let mut chosen: Vec<QueueEntry> = Vec::new();
        let mut skipped = Vec::new();

        while chosen.len() < available {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            let exclusive = configurations
                .get(&entry.config_id)
                .is_none_or(|c| !c.allow_parallel);
            let blocked = exclusive
                && (running(entry.config_id)
                    || chosen.iter().any(|c| c.config_id == entry.config_id));
            if blocked {
                debug!(config_id = %entry.config_id, run_id = %entry.run_id, "Skipping entry of running configuration");
                skipped.push(entry);
            } else {
                chosen.push(entry);
            }
        }

        self.entries.extend(skipped);
        chosen
    }

    /// Remove every entry of a configuration, returning them.
    pub fn remove_config(&mut self, config_id: ConfigId) -> Vec<QueueEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.config_id == config_id);
        self.entries = kept.into();
        removed
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
