//! The scheduler actor.
//!
//! A single task owns the configuration set, the queue and every live
//! [`WorkerHandle`]. HTTP handlers and the lifecycle watcher talk to it through
//! a cloneable [`SchedulerHandle`]; slow work (starting processes, inspecting
//! them, the session sockets) runs in spawned tasks that report back on an
//! internal event channel. All state transitions therefore happen one at a
//! time inside [`Scheduler::run`].

use cachebuild_config::SchedulerConfig;
use cachebuild_core::configuration::BuildConfiguration;
use cachebuild_core::run::{RunStatus, RunUpdate};
use cachebuild_core::runtime::{
    ContainerRuntime, LifecycleAction, LifecycleEvent, ProcessSpec, WorkerName,
};
use cachebuild_core::session::{SessionConfig, SessionMessage};
use cachebuild_core::store::JobStore;
use cachebuild_core::{ConfigId, Error, Result, RunId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::queue::{QueueEntry, QueueManager};
use crate::session::{self, RetryPolicy, SessionConnector, SessionEvent};
use crate::worker::{WorkerHandle, WorkerState};

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;

/// Work reported back to the scheduler by its own tasks.
#[derive(Debug)]
pub(crate) enum Event {
    Provisioned { run_id: RunId, process_id: String },
    ProvisionFailed { run_id: RunId, error: Error },
    Addressed { run_id: RunId, address: String },
    InspectFailed { run_id: RunId, error: Error },
    Session { run_id: RunId, event: SessionEvent },
    ExitGrace { run_id: RunId },
}

impl Event {
    pub(crate) fn session(run_id: RunId, event: SessionEvent) -> Self {
        Event::Session { run_id, event }
    }
}

enum Command {
    Enqueue {
        config_id: ConfigId,
        reply: oneshot::Sender<Result<RunId>>,
    },
    Kill {
        config_id: ConfigId,
        reply: oneshot::Sender<Result<Vec<RunId>>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<usize>>,
    },
    Subscribe {
        run_id: RunId,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Configuration {
        config_id: ConfigId,
        reply: oneshot::Sender<Option<BuildConfiguration>>,
    },
    Configurations {
        reply: oneshot::Sender<Vec<BuildConfiguration>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Lifecycle {
        event: LifecycleEvent,
    },
}

/// A listener attached to a live worker's session.
pub struct Subscription {
    /// Messages received before the listener attached, oldest first.
    pub backlog: Vec<String>,
    /// Messages received from now on. Closes when the worker terminates.
    pub receiver: broadcast::Receiver<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub run_id: RunId,
    pub config_id: ConfigId,
    pub state: WorkerState,
    pub process_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Stream listeners currently attached.
    pub listeners: usize,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub max_concurrency: usize,
    pub configurations: usize,
    pub workers: Vec<WorkerSummary>,
    pub queued: Vec<QueueEntry>,
}

impl SchedulerSnapshot {
    pub fn worker(&self, run_id: RunId) -> Option<&WorkerSummary> {
        self.workers.iter().find(|w| w.run_id == run_id)
    }
}

/// Cloneable handle to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

fn stopped() -> Error {
    Error::Internal("scheduler is not running".to_string())
}

impl SchedulerHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Admit a run of a configuration.
    pub async fn enqueue(&self, config_id: ConfigId) -> Result<RunId> {
        self.request(|reply| Command::Enqueue { config_id, reply })
            .await?
    }

    /// Terminate every live worker of a configuration as `FAILURE`.
    pub async fn kill(&self, config_id: ConfigId) -> Result<Vec<RunId>> {
        self.request(|reply| Command::Kill { config_id, reply }).await?
    }

    /// Reload configurations from the job store.
    pub async fn refresh(&self) -> Result<usize> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    /// Attach to the session of a live run.
    pub async fn subscribe(&self, run_id: RunId) -> Result<Subscription> {
        self.request(|reply| Command::Subscribe { run_id, reply })
            .await?
    }

    pub async fn configuration(&self, config_id: ConfigId) -> Result<Option<BuildConfiguration>> {
        self.request(|reply| Command::Configuration { config_id, reply })
            .await
    }

    pub async fn configurations(&self) -> Result<Vec<BuildConfiguration>> {
        self.request(|reply| Command::Configurations { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Feed a container lifecycle event to the scheduler.
    pub async fn handle_lifecycle_event(&self, event: LifecycleEvent) -> Result<()> {
        self.commands
            .send(Command::Lifecycle { event })
            .await
            .map_err(|_| stopped())
    }
}

/// Owner of the configuration set, the queue and the live workers.
pub struct Scheduler {
    config: SchedulerConfig,
    retry: RetryPolicy,
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    connector: Arc<dyn SessionConnector>,
    configurations: HashMap<ConfigId, BuildConfiguration>,
    queue: QueueManager,
    workers: BTreeMap<RunId, WorkerHandle>,
    events: mpsc::Sender<Event>,
    event_rx: Option<mpsc::Receiver<Event>>,
    command_rx: Option<mpsc::Receiver<Command>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn SessionConnector>,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, event_rx) = mpsc::channel(EVENT_BUFFER);
        let retry = RetryPolicy::new(config.handshake_retries, config.handshake_delay);

        let scheduler = Self {
            config,
            retry,
            queue: QueueManager::new(store.clone()),
            store,
            runtime,
            connector,
            configurations: HashMap::new(),
            workers: BTreeMap::new(),
            events,
            event_rx: Some(event_rx),
            command_rx: Some(command_rx),
        };
        (
            scheduler,
            SchedulerHandle {
                commands: command_tx,
            },
        )
    }

    /// Load configurations, then run the scheduler and its lifecycle watcher
    /// in the background.
    pub async fn start(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<SchedulerHandle> {
        let (mut scheduler, handle) = Self::new(config, store, runtime.clone(), connector);
        scheduler.refresh_configurations().await?;
        tokio::spawn(scheduler.run());
        tokio::spawn(crate::watcher::LifecycleWatcher::new(runtime, handle.clone()).run());
        Ok(handle)
    }

    /// Process commands and events until every handle is dropped.
    pub async fn run(mut self) {
        let (Some(mut commands), Some(mut events)) = (self.command_rx.take(), self.event_rx.take())
        else {
            return;
        };

        info!(
            max_concurrency = self.config.max_concurrency,
            configurations = self.configurations.len(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        info!(live = self.workers.len(), "Scheduler stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { config_id, reply } => {
                let _ = reply.send(self.enqueue(config_id).await);
                self.dispatch().await;
            }
            Command::Kill { config_id, reply } => {
                let _ = reply.send(self.kill(config_id).await);
            }
            Command::Refresh { reply } => {
                let _ = reply.send(self.refresh_configurations().await);
            }
            Command::Subscribe { run_id, reply } => {
                let _ = reply.send(self.subscribe(run_id));
            }
            Command::Configuration { config_id, reply } => {
                let _ = reply.send(self.configurations.get(&config_id).cloned());
            }
            Command::Configurations { reply } => {
                let mut list: Vec<_> = self.configurations.values().cloned().collect();
                list.sort_by_key(|c| c.id);
                let _ = reply.send(list);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Lifecycle { event } => self.handle_lifecycle_event(event).await,
        }
    }

    /// Replace the configuration set with the job store's.
    ///
    /// Live workers keep running with the configuration they were started
    /// with. Queued runs of configurations that no longer exist are failed.
    pub async fn refresh_configurations(&mut self) -> Result<usize> {
        let configurations = self.store.list_configurations().await?;
        self.configurations = configurations.into_iter().map(|c| (c.id, c)).collect();

        let gone: BTreeSet<ConfigId> = self
            .queue
            .entries()
            .map(|e| e.config_id)
            .filter(|id| !self.configurations.contains_key(id))
            .collect();
        for config_id in gone {
            for entry in self.queue.remove_config(config_id) {
                warn!(config_id = %config_id, run_id = %entry.run_id, "Dropping queued run of removed configuration");
                let update = RunUpdate::finished(
                    RunStatus::Failure,
                    "[cachebuild] configuration was removed before the run started\n".to_string(),
                    None,
                    Utc::now(),
                );
                self.flush(entry.run_id, &update).await;
            }
        }

        info!(count = self.configurations.len(), "Configurations refreshed");
        self.dispatch().await;
        Ok(self.configurations.len())
    }

    async fn enqueue(&mut self, config_id: ConfigId) -> Result<RunId> {
        let workers = &self.workers;
        self.queue
            .enqueue(&self.configurations, config_id, |id| {
                workers.values().any(|w| w.config_id == id)
            })
            .await
    }

    /// Start as many queued runs as there are free slots.
    async fn dispatch(&mut self) {
        let available = self
            .config
            .max_concurrency
            .saturating_sub(self.workers.len());
        if available == 0 || self.queue.is_empty() {
            return;
        }

        let workers = &self.workers;
        let entries = self
            .queue
            .drain(available, &self.configurations, |id| {
                workers.values().any(|w| w.config_id == id)
            });
        for entry in entries {
            self.start_build(entry).await;
        }
    }

    async fn start_build(&mut self, entry: QueueEntry) {
        let Some(config) = self.configurations.get(&entry.config_id) else {
            warn!(config_id = %entry.config_id, run_id = %entry.run_id, "Configuration vanished before dispatch");
            let update = RunUpdate::finished(
                RunStatus::Failure,
                "[cachebuild] configuration was removed before the run started\n".to_string(),
                None,
                Utc::now(),
            );
            self.flush(entry.run_id, &update).await;
            return;
        };

        let name = WorkerName::new(entry.config_id, entry.run_id);
        let spec = ProcessSpec {
            image: self.config.builder_image.clone(),
            name: name.format(&self.config.name_prefix),
            labels: name.labels(),
            network: self.config.network.clone(),
        };
        let worker = WorkerHandle::new(
            entry.config_id,
            SessionConfig::for_run(entry.run_id, config),
            self.config.output_buffer_lines,
            self.config.max_log_bytes,
        );
        let started_at = worker.started_at;
        self.workers.insert(entry.run_id, worker);

        if let Err(e) = self
            .store
            .update_run(entry.run_id, &RunUpdate::started(started_at))
            .await
        {
            warn!(run_id = %entry.run_id, error = %e, "Failed to mark run as running");
        }

        info!(
            config_id = %entry.config_id,
            run_id = %entry.run_id,
            name = %spec.name,
            runtime = self.runtime.name(),
            "Provisioning build worker"
        );

        let runtime = self.runtime.clone();
        let events = self.events.clone();
        let run_id = entry.run_id;
        tokio::spawn(async move {
            let event = match runtime.run_process(&spec).await {
                Ok(process_id) => Event::Provisioned { run_id, process_id },
                Err(error) => Event::ProvisionFailed { run_id, error },
            };
            let _ = events.send(event).await;
        });
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Provisioned { run_id, process_id } => match self.workers.get_mut(&run_id) {
                Some(worker) => {
                    debug!(run_id = %run_id, process_id = %process_id, "Worker process created");
                    worker.process_id.get_or_insert(process_id);
                }
                None => {
                    // The run ended while its process was being created.
                    info!(run_id = %run_id, process_id = %process_id, "Removing process of finished run");
                    self.cleanup(process_id, true);
                }
            },
            Event::ProvisionFailed { run_id, error } => {
                error!(run_id = %run_id, error = %error, "Failed to provision build worker");
                self.finalize(
                    run_id,
                    RunStatus::Failure,
                    Some(format!("failed to start build worker: {}", error)),
                )
                .await;
            }
            Event::Addressed { run_id, address } => self.connect(run_id, address),
            Event::InspectFailed { run_id, error } => {
                warn!(run_id = %run_id, error = %error, "Failed to locate build worker");
                self.finalize(
                    run_id,
                    RunStatus::Failure,
                    Some(format!("failed to locate build worker: {}", error)),
                )
                .await;
            }
            Event::Session { run_id, event } => self.handle_session_event(run_id, event).await,
            Event::ExitGrace { run_id } => {
                if self.workers.contains_key(&run_id) {
                    self.finalize(
                        run_id,
                        RunStatus::Failure,
                        Some("build worker exited without a final status".to_string()),
                    )
                    .await;
                }
            }
        }
    }

    /// Route a container start/stop notification to its worker.
    ///
    /// Events for processes that are not builder workers, or for runs that are
    /// not live, are ignored.
    async fn handle_lifecycle_event(&mut self, event: LifecycleEvent) {
        let Some(name) = WorkerName::parse(&self.config.name_prefix, &event.name) else {
            debug!(name = %event.name, "Ignoring event for non-builder process");
            return;
        };
        let Some(worker) = self.workers.get_mut(&name.run_id) else {
            debug!(run_id = %name.run_id, action = ?event.action, "Ignoring event for unknown run");
            return;
        };
        if worker.config_id != name.config_id {
            warn!(
                run_id = %name.run_id,
                expected = %worker.config_id,
                got = %name.config_id,
                "Ignoring event with mismatched configuration"
            );
            return;
        }

        match event.action {
            LifecycleAction::Start => {
                if worker.state != WorkerState::Provisioning {
                    return;
                }
                let process_id = worker.process_id.get_or_insert(event.process_id).clone();
                debug!(run_id = %name.run_id, process_id = %process_id, "Worker started, looking up address");

                let runtime = self.runtime.clone();
                let events = self.events.clone();
                let port = self.config.session_port;
                let run_id = name.run_id;
                tokio::spawn(async move {
                    let event = match runtime.inspect(&process_id).await {
                        Ok(info) => match info.address {
                            Some(host) => Event::Addressed {
                                run_id,
                                address: format!("{}:{}", host, port),
                            },
                            None => Event::InspectFailed {
                                run_id,
                                error: Error::ProvisionFailure(format!(
                                    "process {} has no network address",
                                    process_id
                                )),
                            },
                        },
                        Err(error) => Event::InspectFailed { run_id, error },
                    };
                    let _ = events.send(event).await;
                });
            }
            LifecycleAction::Stop => {
                worker.exited = true;
                worker.process_id.get_or_insert(event.process_id);
                let state = worker.state;
                match state {
                    WorkerState::Provisioning | WorkerState::Connected => {
                        self.finalize(
                            name.run_id,
                            RunStatus::Failure,
                            Some("build worker exited before the session started".to_string()),
                        )
                        .await;
                    }
                    WorkerState::Streaming => {
                        debug!(run_id = %name.run_id, "Worker stopped, waiting for session to finish");
                        let events = self.events.clone();
                        let grace = self.config.exit_grace;
                        let run_id = name.run_id;
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = events.send(Event::ExitGrace { run_id }).await;
                        });
                    }
                    WorkerState::Completed | WorkerState::Failed => {}
                }
            }
        }
    }

    fn connect(&mut self, run_id: RunId, address: String) {
        let Some(worker) = self.workers.get_mut(&run_id) else {
            return;
        };
        if worker.state != WorkerState::Provisioning {
            return;
        }

        info!(run_id = %run_id, address = %address, "Worker reachable, opening build session");
        worker.state = WorkerState::Connected;
        worker.address = Some(address.clone());
        worker.session = Some(tokio::spawn(session::drive(
            self.connector.clone(),
            self.retry,
            run_id,
            address,
            worker.session_config.clone(),
            self.events.clone(),
        )));
    }

    async fn handle_session_event(&mut self, run_id: RunId, event: SessionEvent) {
        let Some(worker) = self.workers.get_mut(&run_id) else {
            return;
        };

        match event {
            SessionEvent::Established => {
                if worker.state == WorkerState::Connected {
                    worker.state = WorkerState::Streaming;
                }
            }
            SessionEvent::Message(raw) => {
                if let Some(SessionMessage::Final { status, durations }) = worker.record(raw) {
                    info!(
                        run_id = %run_id,
                        status = ?status,
                        fetch_ms = durations.fetch_ms,
                        build_ms = durations.build_ms,
                        push_ms = durations.push_ms,
                        total_ms = durations.total_ms,
                        "Worker reported final status"
                    );
                    self.finalize(run_id, status.into(), None).await;
                }
            }
            SessionEvent::Closed => {
                self.finalize(
                    run_id,
                    RunStatus::Failure,
                    Some("build session closed without a final status".to_string()),
                )
                .await;
            }
            SessionEvent::Failed(error) => {
                self.finalize(
                    run_id,
                    RunStatus::Failure,
                    Some(format!("build session failed: {}", error)),
                )
                .await;
            }
        }
    }

    /// Terminate a worker: flush its run, release its slot and dispatch.
    async fn finalize(&mut self, run_id: RunId, status: RunStatus, reason: Option<String>) {
        let Some(mut worker) = self.workers.remove(&run_id) else {
            return;
        };
        worker.state = if status == RunStatus::Success {
            WorkerState::Completed
        } else {
            WorkerState::Failed
        };
        if let Some(reason) = &reason {
            warn!(run_id = %run_id, reason = %reason, "Build failed");
            worker.log.append_trailer(&format!("[cachebuild] {}", reason));
        }

        let update = RunUpdate::finished(
            status,
            worker.log.as_str().to_string(),
            Some(worker.started_at),
            Utc::now(),
        )
        .with_revision(worker.revision.take());
        self.flush(run_id, &update).await;

        info!(
            config_id = %worker.config_id,
            run_id = %run_id,
            status = %status,
            duration_ms = update.duration_ms.unwrap_or_default(),
            "Run finished"
        );

        if let Some(process_id) = worker.process_id.take() {
            self.cleanup(process_id, status != RunStatus::Success && !worker.exited);
        }
        // Dropping the handle ends the session task and closes its listeners.
        drop(worker);

        self.dispatch().await;
    }

    /// Write a terminal update, retrying once.
    async fn flush(&self, run_id: RunId, update: &RunUpdate) {
        if let Err(e) = self.store.update_run(run_id, update).await {
            warn!(run_id = %run_id, error = %e, "Failed to record run status, retrying");
            if let Err(e) = self.store.update_run(run_id, update).await {
                let e = Error::Internal(format!("recording status of run {}: {}", run_id, e));
                error!(run_id = %run_id, error = %e, "Giving up on recording run status");
            }
        }
    }

    /// Remove a worker process, killing it first when asked to.
    fn cleanup(&self, process_id: String, kill: bool) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            if kill {
                if let Err(e) = runtime.kill(&process_id).await {
                    warn!(process_id = %process_id, error = %e, "Failed to kill worker process");
                }
            }
            if let Err(e) = runtime.remove(&process_id).await {
                warn!(process_id = %process_id, error = %e, "Failed to remove worker process");
            }
        });
    }

    async fn kill(&mut self, config_id: ConfigId) -> Result<Vec<RunId>> {
        let run_ids: Vec<RunId> = self
            .workers
            .values()
            .filter(|w| w.config_id == config_id)
            .map(|w| w.run_id)
            .collect();
        if run_ids.is_empty() {
            return Err(Error::NotRunning(format!(
                "no build running for configuration {}",
                config_id
            )));
        }

        for run_id in &run_ids {
            info!(config_id = %config_id, run_id = %run_id, "Killing build");
            self.finalize(*run_id, RunStatus::Failure, Some("killed on request".to_string()))
                .await;
        }
        Ok(run_ids)
    }

    fn subscribe(&self, run_id: RunId) -> Result<Subscription> {
        let worker = self
            .workers
            .get(&run_id)
            .ok_or_else(|| Error::NotFound(format!("no active build session for run {}", run_id)))?;
        Ok(Subscription {
            backlog: worker.output.snapshot(),
            receiver: worker.listeners.subscribe(),
        })
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            max_concurrency: self.config.max_concurrency,
            configurations: self.configurations.len(),
            workers: self
                .workers
                .values()
                .map(|w| WorkerSummary {
                    run_id: w.run_id,
                    config_id: w.config_id,
                    state: w.state,
                    process_id: w.process_id.clone(),
                    started_at: w.started_at,
                    listeners: w.listeners.receiver_count(),
                })
                .collect(),
            queued: self.queue.entries().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::worker::LOG_TRUNCATED_MARKER;
    use cachebuild_core::run::RunRecord;
    use cachebuild_db::MemoryJobStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        handle: SchedulerHandle,
        store: Arc<MemoryJobStore>,
        runtime: Arc<FakeRuntime>,
        connector: Arc<FakeConnector>,
    }

    fn scheduler_config(max_concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency,
            name_prefix: PREFIX.to_string(),
            session_port: SESSION_PORT,
            ..Default::default()
        }
    }

    async fn harness_with(
        configs: &[(i64, bool)],
        config: SchedulerConfig,
        wrap: impl FnOnce(Arc<MemoryJobStore>) -> Arc<dyn JobStore>,
    ) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        for (id, parallel) in configs {
            store.insert_configuration(configuration(*id, *parallel)).await;
        }
        let runtime = Arc::new(FakeRuntime::default());
        let connector = Arc::new(FakeConnector::default());

        let (mut scheduler, handle) = Scheduler::new(
            config,
            wrap(store.clone()),
            runtime.clone(),
            connector.clone(),
        );
        scheduler.refresh_configurations().await.unwrap();
        tokio::spawn(scheduler.run());

        Harness {
            handle,
            store,
            runtime,
            connector,
        }
    }

    async fn harness(configs: &[(i64, bool)], max_concurrency: usize) -> Harness {
        harness_with(configs, scheduler_config(max_concurrency), |s| s).await
    }

    impl Harness {
        async fn wait_for(
            &self,
            what: &str,
            check: impl Fn(&SchedulerSnapshot) -> bool,
        ) -> SchedulerSnapshot {
            for _ in 0..2000 {
                let snapshot = self.handle.snapshot().await.unwrap();
                assert!(snapshot.workers.len() <= snapshot.max_concurrency);
                if check(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {}", what);
        }

        async fn record(&self, run_id: RunId) -> RunRecord {
            self.store.get_run(run_id).await.unwrap().unwrap()
        }

        async fn wait_for_status(&self, run_id: RunId, status: RunStatus) -> RunRecord {
            for _ in 0..2000 {
                let record = self.record(run_id).await;
                if record.status == status {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("run {} never reached {}", run_id, status);
        }

        async fn lifecycle(&self, action: LifecycleAction, config_id: i64, run_id: RunId) {
            self.handle
                .handle_lifecycle_event(LifecycleEvent {
                    action,
                    process_id: process_id(config_id, run_id),
                    name: format!("/{}", worker_name(config_id, run_id)),
                })
                .await
                .unwrap();
        }

        /// Report the worker started and wait until its session is streaming.
        async fn bring_up(&self, config_id: i64, run_id: RunId) {
            self.wait_for("provisioning", |s| s.worker(run_id).is_some())
                .await;
            self.lifecycle(LifecycleAction::Start, config_id, run_id)
                .await;
            self.wait_for("streaming", |s| {
                s.worker(run_id).map(|w| w.state) == Some(WorkerState::Streaming)
            })
            .await;
        }

        fn emit(&self, config_id: i64, run_id: RunId, message: &str) {
            self.connector
                .emit(&session_address(config_id, run_id), message);
        }

        async fn finish(&self, config_id: i64, run_id: RunId) {
            self.emit(config_id, run_id, r#"{"type":"final","status":"success"}"#);
            self.wait_for_status(run_id, RunStatus::Success).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_runs_to_success() {
        let h = harness(&[(1, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;

        assert_eq!(h.record(run_id).await.status, RunStatus::Running);
        let sent = h.connector.sent();
        assert_eq!(sent.len(), 1);
        let payload: SessionConfig = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(payload.run_id, run_id);
        assert_eq!(payload.push.cache_url, "https://cache.example.com/main");

        h.emit(1, run_id, r#"{"type":"statusUpdate","status":"fetched","revision":"deadbeef"}"#);
        h.emit(1, run_id, r#"{"type":"output","line":"building hello"}"#);
        h.emit(
            1,
            run_id,
            r#"{"type":"final","status":"success","durations":{"totalMs":5}}"#,
        );

        let record = h.wait_for_status(run_id, RunStatus::Success).await;
        assert_eq!(record.log, "building hello\n");
        assert_eq!(record.revision.as_deref(), Some("deadbeef"));
        assert!(record.ended_at.is_some());
        assert!(record.duration_ms.is_some());

        h.wait_for("worker removed", |s| s.workers.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.runtime.removed(), vec![process_id(1, run_id)]);
        assert!(h.runtime.killed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_is_labeled_with_configuration_and_run() {
        let h = harness(&[(3, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(3)).await.unwrap();
        h.wait_for("provisioning", |s| s.worker(run_id).is_some()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = h.runtime.started.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].name, worker_name(3, run_id));
        assert_eq!(started[0].labels[cachebuild_core::runtime::RUN_LABEL], run_id.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_parallel_enqueue_conflicts_while_running() {
        let h = harness(&[(42, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(42)).await.unwrap();
        h.bring_up(42, run_id).await;

        let result = h.handle.enqueue(ConfigId::new(42)).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(h.store.runs().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_unknown_configuration() {
        let h = harness(&[], 4).await;
        let result = h.handle.enqueue(ConfigId::new(9)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_workers_never_exceed_max_concurrency() {
        let h = harness(&[(1, true)], 2).await;
        let a = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        let b = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        let c = h.handle.enqueue(ConfigId::new(1)).await.unwrap();

        let snapshot = h.wait_for("two workers", |s| s.workers.len() == 2).await;
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.queued[0].run_id, c);
        assert_eq!(h.record(c).await.status, RunStatus::Queued);

        h.bring_up(1, a).await;
        h.bring_up(1, b).await;
        h.finish(1, a).await;

        h.wait_for("third dispatched", |s| s.worker(c).is_some()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_follows_arrival_order() {
        let h = harness(&[(1, false), (2, false), (3, false)], 1).await;
        let a = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        let b = h.handle.enqueue(ConfigId::new(2)).await.unwrap();
        let c = h.handle.enqueue(ConfigId::new(3)).await.unwrap();

        h.bring_up(1, a).await;
        h.finish(1, a).await;
        h.bring_up(2, b).await;
        h.finish(2, b).await;
        h.bring_up(3, c).await;
        h.finish(3, c).await;

        assert_eq!(
            h.runtime.started_names(),
            vec![worker_name(1, a), worker_name(2, b), worker_name(3, c)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_runs_of_one_configuration_run_one_at_a_time() {
        let h = harness(&[(1, false), (5, false)], 1).await;
        let blocker = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        // Configuration 5 is queued, not running, so both are admitted.
        let first = h.handle.enqueue(ConfigId::new(5)).await.unwrap();
        let second = h.handle.enqueue(ConfigId::new(5)).await.unwrap();

        h.bring_up(1, blocker).await;
        h.finish(1, blocker).await;

        let snapshot = h.wait_for("first dispatched", |s| s.worker(first).is_some()).await;
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.queued[0].run_id, second);

        h.bring_up(5, first).await;
        h.finish(5, first).await;
        h.wait_for("second dispatched", |s| s.worker(second).is_some()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_final_fails_and_drains_queue() {
        let h = harness(&[(1, false), (2, false)], 1).await;
        let a = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        let b = h.handle.enqueue(ConfigId::new(2)).await.unwrap();
        h.bring_up(1, a).await;
        h.emit(1, a, r#"{"type":"output","line":"half way"}"#);

        h.connector.close(&session_address(1, a));

        let record = h.wait_for_status(a, RunStatus::Failure).await;
        assert!(record.log.starts_with("half way\n"));
        assert!(record.log.contains("closed without a final status"));
        let snapshot = h.wait_for("next run dispatched", |s| s.worker(b).is_some()).await;
        assert!(snapshot.worker(a).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_exhaustion_fails_and_kills_process() {
        let h = harness(&[(1, false)], 4).await;
        h.connector.refuse.store(true, Ordering::SeqCst);
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.wait_for("provisioning", |s| s.worker(run_id).is_some()).await;
        h.lifecycle(LifecycleAction::Start, 1, run_id).await;

        let record = h.wait_for_status(run_id, RunStatus::Failure).await;
        assert!(record.log.contains("build session failed"));
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 6);

        h.wait_for("worker removed", |s| s.workers.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.runtime.killed(), vec![process_id(1, run_id)]);
        assert_eq!(h.runtime.removed(), vec![process_id(1, run_id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_before_handshake_fails() {
        let h = harness(&[(1, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.wait_for("process created", |s| {
            s.worker(run_id).and_then(|w| w.process_id.as_ref()).is_some()
        })
        .await;

        h.lifecycle(LifecycleAction::Stop, 1, run_id).await;

        let record = h.wait_for_status(run_id, RunStatus::Failure).await;
        assert!(record.log.contains("exited before the session started"));
        h.wait_for("worker removed", |s| s.workers.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.runtime.killed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_message_within_exit_grace_wins() {
        let h = harness(&[(1, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;

        h.lifecycle(LifecycleAction::Stop, 1, run_id).await;
        h.emit(1, run_id, r#"{"type":"final","status":"success"}"#);

        h.wait_for_status(run_id, RunStatus::Success).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_final_fails_after_exit_grace() {
        let mut config = scheduler_config(4);
        config.exit_grace = Duration::from_millis(500);
        let h = harness_with(&[(1, false)], config, |s| s).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;

        h.lifecycle(LifecycleAction::Stop, 1, run_id).await;

        let record = h.wait_for_status(run_id, RunStatus::Failure).await;
        assert!(record.log.contains("exited without a final status"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_failure_marks_run_failed() {
        let h = harness(&[(1, false)], 4).await;
        h.runtime.fail_start.store(true, Ordering::SeqCst);
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();

        let record = h.wait_for_status(run_id, RunStatus::Failure).await;
        assert!(record.log.contains("image not found"));
        h.wait_for("worker removed", |s| s.workers.is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_address_fails_run() {
        let h = harness(&[(1, false)], 4).await;
        h.runtime.no_address.store(true, Ordering::SeqCst);
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.wait_for("provisioning", |s| s.worker(run_id).is_some()).await;
        h.lifecycle(LifecycleAction::Start, 1, run_id).await;

        let record = h.wait_for_status(run_id, RunStatus::Failure).await;
        assert!(record.log.contains("no network address"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_running_build() {
        let h = harness(&[(1, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;

        let killed = h.handle.kill(ConfigId::new(1)).await.unwrap();
        assert_eq!(killed, vec![run_id]);

        let record = h.record(run_id).await;
        assert_eq!(record.status, RunStatus::Failure);
        assert!(record.log.contains("killed on request"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.runtime.killed(), vec![process_id(1, run_id)]);

        let again = h.handle.kill(ConfigId::new(1)).await;
        assert!(matches!(again, Err(Error::NotRunning(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reason_follows_truncated_log() {
        let config = SchedulerConfig {
            max_log_bytes: 16,
            ..scheduler_config(4)
        };
        let h = harness_with(&[(1, false)], config, |s| s).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;
        let mut subscription = h.handle.subscribe(run_id).await.unwrap();
        h.emit(1, run_id, r#"{"type":"output","line":"a line that overflows the log"}"#);
        subscription.receiver.recv().await.unwrap();

        h.handle.kill(ConfigId::new(1)).await.unwrap();
        let record = h.wait_for_status(run_id, RunStatus::Failure).await;
        assert!(record.log.contains(LOG_TRUNCATED_MARKER));
        assert!(record.log.ends_with("[cachebuild] killed on request\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_without_running_build() {
        let h = harness(&[(1, false)], 4).await;
        let result = h.handle.kill(ConfigId::new(1)).await;
        assert!(matches!(result, Err(Error::NotRunning(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognized_lifecycle_events_are_ignored() {
        let h = harness(&[(1, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.wait_for("provisioning", |s| s.worker(run_id).is_some()).await;

        let names = [
            "postgres".to_string(),
            format!("{}-x-y", PREFIX),
            format!("{}-1-999", PREFIX),
            // Right run, wrong configuration.
            format!("{}-2-{}", PREFIX, run_id),
        ];
        for name in names {
            h.handle
                .handle_lifecycle_event(LifecycleEvent {
                    action: LifecycleAction::Stop,
                    process_id: "other".to_string(),
                    name,
                })
                .await
                .unwrap();
        }

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(
            snapshot.worker(run_id).map(|w| w.state),
            Some(WorkerState::Provisioning)
        );
        assert_eq!(h.record(run_id).await.status, RunStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_idempotent() {
        let h = harness(&[(1, false), (2, true)], 4).await;
        let before = h.handle.configurations().await.unwrap();
        h.handle.refresh().await.unwrap();
        let once = h.handle.configurations().await.unwrap();
        h.handle.refresh().await.unwrap();
        let twice = h.handle.configurations().await.unwrap();

        assert_eq!(before, once);
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_picks_up_new_and_drops_removed_configurations() {
        let h = harness(&[(1, false), (2, false)], 1).await;
        let a = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        let b = h.handle.enqueue(ConfigId::new(2)).await.unwrap();
        h.bring_up(1, a).await;

        h.store.remove_configuration(ConfigId::new(2)).await;
        h.store.insert_configuration(configuration(3, false)).await;
        assert_eq!(h.handle.refresh().await.unwrap(), 2);

        assert_eq!(h.record(b).await.status, RunStatus::Failure);
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.queued.is_empty());
        // The in-flight run is untouched.
        assert_eq!(
            snapshot.worker(a).map(|w| w.state),
            Some(WorkerState::Streaming)
        );
        assert!(h.handle.configuration(ConfigId::new(3)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_to_non_parallel_holds_queued_runs() {
        let h = harness(&[(1, true), (2, false)], 2).await;
        let blocker = h.handle.enqueue(ConfigId::new(2)).await.unwrap();
        let a = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        let b = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(2, blocker).await;
        h.bring_up(1, a).await;

        h.store.insert_configuration(configuration(1, false)).await;
        h.handle.refresh().await.unwrap();
        h.finish(2, blocker).await;
        h.wait_for("blocker removed", |s| s.worker(blocker).is_none())
            .await;

        let snapshot = h.handle.snapshot().await.unwrap();
        let live: Vec<RunId> = snapshot
            .workers
            .iter()
            .filter(|w| w.config_id == ConfigId::new(1))
            .map(|w| w.run_id)
            .collect();
        assert_eq!(live, vec![a]);
        assert_eq!(snapshot.queued.iter().map(|e| e.run_id).collect::<Vec<_>>(), vec![b]);

        h.finish(1, a).await;
        h.wait_for("second run dispatched", |s| s.worker(b).is_some())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_flush_is_retried_once() {
        let h = harness_with(&[(1, false)], scheduler_config(4), |s| {
            Arc::new(FlakyStore::new(s, 1))
        })
        .await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;
        h.emit(1, run_id, r#"{"type":"final","status":"failure"}"#);

        h.wait_for_status(run_id, RunStatus::Failure).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_removed_even_when_flush_fails() {
        let h = harness_with(&[(1, false)], scheduler_config(4), |s| {
            Arc::new(FlakyStore::new(s, 2))
        })
        .await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;
        h.emit(1, run_id, r#"{"type":"final","status":"success"}"#);

        h.wait_for("worker removed", |s| s.workers.is_empty()).await;
        assert_eq!(h.record(run_id).await.status, RunStatus::Running);

        // The slot is free again.
        let next = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.wait_for("next dispatched", |s| s.worker(next).is_some()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_gets_backlog_then_live_messages() {
        let h = harness(&[(1, false)], 4).await;
        let run_id = h.handle.enqueue(ConfigId::new(1)).await.unwrap();
        h.bring_up(1, run_id).await;

        let early = r#"{"type":"output","line":"one"}"#;
        h.emit(1, run_id, early);
        let mut subscription = h.handle.subscribe(run_id).await.unwrap();
        for _ in 0..100 {
            if !subscription.backlog.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            subscription = h.handle.subscribe(run_id).await.unwrap();
        }
        assert_eq!(subscription.backlog, vec![early.to_string()]);

        let last = r#"{"type":"final","status":"success"}"#;
        h.emit(1, run_id, last);
        assert_eq!(subscription.receiver.recv().await.unwrap(), last);
        assert!(matches!(
            subscription.receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_to_unknown_run() {
        let h = harness(&[(1, false)], 4).await;
        let result = h.handle.subscribe(RunId::new(77)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
