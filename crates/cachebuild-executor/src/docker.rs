//! Docker container runtime for build workers.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EventMessage, EventMessageTypeEnum, HostConfig, NetworkSettings};
use bollard::system::EventsOptions;
use cachebuild_core::runtime::{
    ContainerRuntime, LifecycleAction, LifecycleEvent, ProcessInfo, ProcessSpec,
};
use cachebuild_core::{Error, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Runs build workers as containers on a Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                // A locally built image may not exist in any registry.
                Err(e) => warn!(error = %e, "Pull warning"),
            }
        }
    }
}

/// Docker events the runtime subscribes to.
fn event_filters() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("type".to_string(), vec!["container".to_string()]),
        (
            "event".to_string(),
            vec!["start".to_string(), "die".to_string()],
        ),
    ])
}

/// Translate a Docker event into a lifecycle event.
///
/// Returns `None` for events the scheduler has no interest in and an error for
/// container events missing the fields needed to identify the process.
fn map_event(event: EventMessage) -> Option<Result<LifecycleEvent>> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let action = match event.action.as_deref() {
        Some("start") => LifecycleAction::Start,
        Some("die") | Some("stop") => LifecycleAction::Stop,
        _ => return None,
    };

    let Some(actor) = event.actor else {
        return Some(Err(Error::InvalidInput(
            "container event without actor".to_string(),
        )));
    };
    let Some(process_id) = actor.id else {
        return Some(Err(Error::InvalidInput(
            "container event without id".to_string(),
        )));
    };
    let Some(name) = actor.attributes.and_then(|mut attrs| attrs.remove("name")) else {
        return Some(Err(Error::InvalidInput(format!(
            "container event for {} without name",
            process_id
        ))));
    };

    Some(Ok(LifecycleEvent {
        action,
        process_id,
        name,
    }))
}

/// Pick the address a worker is reachable on.
///
/// Prefers the address on the configured network, falling back to the
/// default bridge address.
fn select_address(settings: &NetworkSettings, network: Option<&str>) -> Option<String> {
    let on_network = network.and_then(|network| {
        settings
            .networks
            .as_ref()?
            .get(network)?
            .ip_address
            .clone()
    });
    on_network
        .or_else(|| settings.ip_address.clone())
        .filter(|ip| !ip.is_empty())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run_process(&self, spec: &ProcessSpec) -> Result<String> {
        self.pull(&spec.image).await;

        let host_config = HostConfig {
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        info!(container = %spec.name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ProvisionFailure(format!("create {}: {}", spec.name, e)))?;

        info!(container = %spec.name, id = %container.id, "Starting container");
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ProvisionFailure(format!("start {}: {}", spec.name, e)))?;

        Ok(container.id)
    }

    async fn inspect(&self, process_id: &str) -> Result<ProcessInfo> {
        let inspect = self
            .docker
            .inspect_container(process_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::NotFound(format!("container {}: {}", process_id, e)))?;

        let network = inspect
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.as_deref());
        let address = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| select_address(settings, network));

        Ok(ProcessInfo { address })
    }

    async fn lifecycle_events(&self) -> Result<BoxStream<'static, Result<LifecycleEvent>>> {
        let options = EventsOptions::<String> {
            filters: event_filters(),
            ..Default::default()
        };

        let stream = self
            .docker
            .events(Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(event) => map_event(event),
                    Err(e) => Some(Err(Error::Internal(format!("docker events: {}", e)))),
                }
            });

        Ok(stream.boxed())
    }

    async fn kill(&self, process_id: &str) -> Result<()> {
        self.docker
            .kill_container(process_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| Error::Internal(format!("kill {}: {}", process_id, e)))
    }

    async fn remove(&self, process_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(process_id, Some(options))
            .await
            .map_err(|e| Error::Internal(format!("remove {}: {}", process_id, e)))
    }
}
