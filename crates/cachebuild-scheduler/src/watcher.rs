//! Forwards container lifecycle events to the scheduler.

use cachebuild_core::runtime::ContainerRuntime;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::scheduler::SchedulerHandle;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Subscribes to the runtime's lifecycle events and relays them.
///
/// The subscription is re-established whenever it fails or ends. The watcher
/// stops once the scheduler is gone.
pub struct LifecycleWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    scheduler: SchedulerHandle,
    resubscribe_delay: Duration,
}

impl LifecycleWatcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, scheduler: SchedulerHandle) -> Self {
        Self {
            runtime,
            scheduler,
            resubscribe_delay: RESUBSCRIBE_DELAY,
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub async fn run(self) {
        info!(runtime = self.runtime.name(), "Watching worker lifecycle events");
        loop {
            match self.runtime.lifecycle_events().await {
                Ok(mut events) => {
                    while let Some(item) = events.next().await {
                        match item {
                            Ok(event) => {
                                debug!(name = %event.name, action = ?event.action, "Lifecycle event");
                                if self.scheduler.handle_lifecycle_event(event).await.is_err() {
                                    info!("Scheduler stopped, lifecycle watcher exiting");
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "Skipping unreadable lifecycle event"),
                        }
                    }
                    warn!("Lifecycle event stream ended, resubscribing");
                }
                Err(e) => {
                    error!(error = %e, "Failed to subscribe to lifecycle events");
                }
            }
            tokio::time::sleep(self.resubscribe_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::testing::*;
    use cachebuild_config::SchedulerConfig;
    use cachebuild_core::runtime::{LifecycleAction, LifecycleEvent};
    use cachebuild_core::run::RunStatus;
    use cachebuild_core::store::JobStore;
    use cachebuild_core::{ConfigId, Error};
    use cachebuild_db::MemoryJobStore;

    #[tokio::test(start_paused = true)]
    async fn test_watcher_relays_events_and_skips_errors() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert_configuration(configuration(1, false)).await;
        let (runtime, events) = FakeRuntime::with_events();
        let runtime = Arc::new(runtime);
        let config = SchedulerConfig {
            name_prefix: PREFIX.to_string(),
            ..Default::default()
        };

        let (mut scheduler, handle) = Scheduler::new(
            config,
            store.clone(),
            runtime.clone(),
            Arc::new(FakeConnector::default()),
        );
        scheduler.refresh_configurations().await.unwrap();
        tokio::spawn(scheduler.run());
        tokio::spawn(
            LifecycleWatcher::new(runtime, handle.clone())
                .with_resubscribe_delay(Duration::from_millis(50))
                .run(),
        );

        let run_id = handle.enqueue(ConfigId::new(1)).await.unwrap();
        events
            .send(Err(Error::InvalidInput("event without a name".to_string())))
            .unwrap();
        events
            .send(Ok(LifecycleEvent {
                action: LifecycleAction::Stop,
                process_id: process_id(1, run_id),
                name: worker_name(1, run_id),
            }))
            .unwrap();

        for _ in 0..100 {
            let record = store.get_run(run_id).await.unwrap().unwrap();
            if record.status == RunStatus::Failure {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stop event was not relayed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_exits_when_scheduler_is_gone() {
        let (runtime, events) = FakeRuntime::with_events();
        let store = Arc::new(MemoryJobStore::new());
        let runtime = Arc::new(runtime);
        let (scheduler, handle) = Scheduler::new(
            SchedulerConfig::default(),
            store,
            runtime.clone(),
            Arc::new(FakeConnector::default()),
        );
        drop(scheduler);

        let watcher = tokio::spawn(LifecycleWatcher::new(runtime, handle).run());
        events
            .send(Ok(LifecycleEvent {
                action: LifecycleAction::Start,
                process_id: "p".to_string(),
                name: "anything".to_string(),
            }))
            .unwrap();

        watcher.await.unwrap();
    }
}
