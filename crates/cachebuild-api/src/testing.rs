//! Router fixtures shared by the endpoint tests.

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::Request;
use axum::response::Response;
use cachebuild_config::{SchedulerConfig, StreamConfig};
use cachebuild_core::configuration::{
    BuildConfiguration, BuildInvocation, PushTarget, SourceSpec, TriggerMode,
};
use cachebuild_core::runtime::{
    ContainerRuntime, LifecycleAction, LifecycleEvent, ProcessInfo, ProcessSpec, WorkerName,
};
use cachebuild_core::store::CacheRecord;
use cachebuild_core::{CacheId, ConfigId, Result, RunId};
use cachebuild_db::{MemoryAccessOracle, MemoryJobStore, MemoryMessageBus, MemoryNodeRegistry};
use cachebuild_scheduler::{
    Coordinator, Scheduler, SessionConnector, SessionTransport, WorkerState,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

use crate::AppState;

pub(crate) const ADMIN_TOKEN: &str = "admin-secret";
pub(crate) const READER_TOKEN: &str = "reader-token";
pub(crate) const WEBHOOK_SECRET: &str = "hook-secret";

fn configuration(id: i64, trigger: TriggerMode) -> BuildConfiguration {
    BuildConfiguration {
        id: ConfigId::new(id),
        name: format!("config-{}", id),
        cache_id: CacheId::new(1),
        arch: "x86_64-linux".to_string(),
        allow_parallel: false,
        source: SourceSpec::None,
        invocation: BuildInvocation {
            command: "nix build".to_string(),
            substituters: vec![],
            trusted_public_keys: vec![],
            max_jobs: None,
            cores: None,
        },
        push: PushTarget {
            cache_url: "https://cache.example.com/main".to_string(),
            token: "push-token".to_string(),
        },
        trigger,
    }
}

/// Runtime whose processes start instantly and never emit events.
struct TestRuntime;

#[async_trait]
impl ContainerRuntime for TestRuntime {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn run_process(&self, spec: &ProcessSpec) -> Result<String> {
        Ok(format!("proc-{}", spec.name))
    }

    async fn inspect(&self, process_id: &str) -> Result<ProcessInfo> {
        Ok(ProcessInfo {
            address: Some(format!("host-{}", process_id)),
        })
    }

    async fn lifecycle_events(&self) -> Result<BoxStream<'static, Result<LifecycleEvent>>> {
        Ok(futures::stream::pending().boxed())
    }

    async fn kill(&self, _process_id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _process_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Session connector whose workers are played by the test.
#[derive(Default)]
pub(crate) struct TestConnector {
    links: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    connections: AtomicUsize,
}

impl TestConnector {
    pub fn emit(&self, address: &str, message: &str) {
        if let Some(link) = self.links.lock().unwrap().get(address) {
            link.send(message.to_string()).unwrap();
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.links.lock().unwrap().contains_key(address)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for TestConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn SessionTransport>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().insert(address.to_string(), tx);
        Ok(Box::new(TestTransport { rx }))
    }
}

struct TestTransport {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl SessionTransport for TestTransport {
    async fn send(&mut self, _text: String) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

pub(crate) struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryJobStore>,
    pub registry: Arc<MemoryNodeRegistry>,
    pub connector: Arc<TestConnector>,
    prefix: String,
}

impl TestApp {
    pub async fn local() -> Self {
        Self::build(false).await
    }

    pub async fn remote() -> Self {
        Self::build(true).await
    }

    async fn build(remote: bool) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        store
            .insert_cache(CacheRecord {
                id: CacheId::new(1),
                name: "main".to_string(),
            })
            .await;
        store
            .insert_configuration(configuration(1, TriggerMode::Manual))
            .await;
        store
            .insert_configuration(configuration(
                2,
                TriggerMode::Webhook {
                    secret: Some(WEBHOOK_SECRET.to_string()),
                },
            ))
            .await;
        store
            .insert_configuration(configuration(3, TriggerMode::Webhook { secret: None }))
            .await;

        let oracle = Arc::new(MemoryAccessOracle::new());
        oracle.grant(CacheId::new(1), READER_TOKEN).await;
        let registry = Arc::new(MemoryNodeRegistry::new());
        let connector = Arc::new(TestConnector::default());

        let config = SchedulerConfig::default();
        let prefix = config.name_prefix.clone();
        let scheduler = Scheduler::start(
            config,
            store.clone(),
            Arc::new(TestRuntime),
            connector.clone(),
        )
        .await
        .unwrap();

        let mut state = AppState::new(scheduler, store.clone(), oracle)
            .with_admin_token(Some(ADMIN_TOKEN.to_string()))
            .with_stream_config(StreamConfig {
                grace: Duration::from_millis(20),
            });
        if remote {
            let coordinator = Coordinator::new(
                store.clone(),
                Arc::new(MemoryMessageBus::new()),
                registry.clone(),
            );
            state = state.with_coordinator(Arc::new(coordinator));
        }

        Self {
            router: crate::routes::router(state.clone()),
            state,
            store,
            registry,
            connector,
            prefix,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Report the run's worker as started and wait for its session.
    ///
    /// Returns the session address.
    pub async fn bring_up(&self, config_id: i64, run_id: RunId) -> String {
        let name = WorkerName::new(ConfigId::new(config_id), run_id).format(&self.prefix);
        let process_id = format!("proc-{}", name);
        let address = format!("host-{}:8080", process_id);

        self.state
            .scheduler
            .handle_lifecycle_event(LifecycleEvent {
                action: LifecycleAction::Start,
                process_id,
                name,
            })
            .await
            .unwrap();

        for _ in 0..500 {
            let snapshot = self.state.scheduler.snapshot().await.unwrap();
            let streaming = snapshot
                .worker(run_id)
                .is_some_and(|w| w.state == WorkerState::Streaming);
            if streaming && self.connector.is_connected(&address) {
                return address;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker for run {} never started streaming", run_id);
    }
}

pub(crate) fn post_request(path: &str) -> Request<Body> {
    Request::post(path).body(Body::empty()).unwrap()
}

pub(crate) fn admin_request(method: &str, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("Authorization", format!("Bearer {}", ADMIN_TOKEN))
        .body(Body::empty())
        .unwrap()
}

pub(crate) fn stream_request(run_id: i64, token: Option<&str>) -> Request<Body> {
    let builder = Request::get(format!("/builds/{}/stream", run_id));
    let builder = match token {
        Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
        None => builder,
    };
    builder.body(Body::empty()).unwrap()
}

pub(crate) async fn json_body<T: DeserializeOwned>(response: Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
