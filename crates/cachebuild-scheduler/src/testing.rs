//! Fakes shared by the scheduler tests.

use async_trait::async_trait;
use cachebuild_core::configuration::{
    BuildConfiguration, BuildInvocation, PushTarget, SourceSpec, TriggerMode,
};
use cachebuild_core::run::{RunRecord, RunStatus, RunUpdate};
use cachebuild_core::runtime::{
    ContainerRuntime, LifecycleEvent, ProcessInfo, ProcessSpec, WorkerName,
};
use cachebuild_core::store::{CacheRecord, JobStore};
use cachebuild_core::{CacheId, ConfigId, Error, Result, RunId};
use cachebuild_db::MemoryJobStore;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::session::{SessionConnector, SessionTransport};

pub(crate) const PREFIX: &str = "test-builder";
pub(crate) const SESSION_PORT: u16 = 8080;

pub(crate) fn configuration(id: i64, allow_parallel: bool) -> BuildConfiguration {
    BuildConfiguration {
        id: ConfigId::new(id),
        name: format!("config-{}", id),
        cache_id: CacheId::new(1),
        arch: "x86_64-linux".to_string(),
        allow_parallel,
        source: SourceSpec::None,
        invocation: BuildInvocation {
            command: "nix build .#default".to_string(),
            substituters: vec![],
            trusted_public_keys: vec![],
            max_jobs: None,
            cores: None,
        },
        push: PushTarget {
            cache_url: "https://cache.example.com/main".to_string(),
            token: "push-token".to_string(),
        },
        trigger: TriggerMode::Manual,
    }
}

pub(crate) fn worker_name(config_id: i64, run_id: RunId) -> String {
    WorkerName::new(ConfigId::new(config_id), run_id).format(PREFIX)
}

pub(crate) fn process_id(config_id: i64, run_id: RunId) -> String {
    format!("proc-{}", worker_name(config_id, run_id))
}

pub(crate) fn session_address(config_id: i64, run_id: RunId) -> String {
    format!("addr-{}:{}", process_id(config_id, run_id), SESSION_PORT)
}

/// Container runtime that records what it was asked to do.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    pub started: Mutex<Vec<ProcessSpec>>,
    pub killed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_start: AtomicBool,
    pub no_address: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<LifecycleEvent>>>>,
}

impl FakeRuntime {
    /// A runtime whose lifecycle subscription yields what is sent on the
    /// returned channel. Later subscriptions fail.
    pub fn with_events() -> (Self, mpsc::UnboundedSender<Result<LifecycleEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Self {
            events: Mutex::new(Some(rx)),
            ..Default::default()
        };
        (runtime, tx)
    }

    pub fn started_names(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run_process(&self, spec: &ProcessSpec) -> Result<String> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::ProvisionFailure("image not found".to_string()));
        }
        self.started.lock().unwrap().push(spec.clone());
        Ok(format!("proc-{}", spec.name))
    }

    async fn inspect(&self, process_id: &str) -> Result<ProcessInfo> {
        if self.no_address.load(Ordering::SeqCst) {
            return Ok(ProcessInfo::default());
        }
        Ok(ProcessInfo {
            address: Some(format!("addr-{}", process_id)),
        })
    }

    async fn lifecycle_events(&self) -> Result<BoxStream<'static, Result<LifecycleEvent>>> {
        match self.events.lock().unwrap().take() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(Error::Internal("event source gone".to_string())),
        }
    }

    async fn kill(&self, process_id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(process_id.to_string());
        Ok(())
    }

    async fn remove(&self, process_id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(process_id.to_string());
        Ok(())
    }
}

/// Session connector whose sockets are driven by the test.
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub attempts: AtomicU32,
    pub refuse: AtomicBool,
    sent: Arc<Mutex<Vec<String>>>,
    links: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl FakeConnector {
    /// Deliver a message from the worker at `address`.
    pub fn emit(&self, address: &str, message: &str) {
        let links = self.links.lock().unwrap();
        let link = links
            .get(address)
            .unwrap_or_else(|| panic!("no session open to {}", address));
        link.send(message.to_string()).unwrap();
    }

    /// Close the socket of the worker at `address`.
    pub fn close(&self, address: &str) {
        self.links.lock().unwrap().remove(address);
    }

    /// Configuration payloads the workers received.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn SessionTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ProtocolFailure("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().insert(address.to_string(), tx);
        Ok(Box::new(FakeTransport {
            rx,
            sent: self.sent.clone(),
        }))
    }
}

struct FakeTransport {
    rx: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Job store that fails a number of terminal updates before recovering.
pub(crate) struct FlakyStore {
    pub inner: Arc<MemoryJobStore>,
    pub terminal_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryJobStore>, terminal_failures: u32) -> Self {
        Self {
            inner,
            terminal_failures: AtomicU32::new(terminal_failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_run(&self, config_id: ConfigId, status: RunStatus) -> Result<RunId> {
        self.inner.create_run(config_id, status).await
    }

    async fn update_run(&self, id: RunId, update: &RunUpdate) -> Result<()> {
        if update.status.is_terminal()
            && self
                .terminal_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Internal("connection reset".to_string()));
        }
        self.inner.update_run(id, update).await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        self.inner.get_run(id).await
    }

    async fn list_configurations(&self) -> Result<Vec<BuildConfiguration>> {
        self.inner.list_configurations().await
    }

    async fn get_configuration(&self, id: ConfigId) -> Result<Option<BuildConfiguration>> {
        self.inner.get_configuration(id).await
    }

    async fn get_cache(&self, id: CacheId) -> Result<Option<CacheRecord>> {
        self.inner.get_cache(id).await
    }
}
