//! Application state.

use cachebuild_config::StreamConfig;
use cachebuild_core::auth::AccessOracle;
use cachebuild_core::store::JobStore;
use cachebuild_scheduler::{Coordinator, SchedulerHandle};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub store: Arc<dyn JobStore>,
    pub oracle: Arc<dyn AccessOracle>,
    /// Set in remote dispatch mode: builds are advertised to nodes instead of
    /// being started locally.
    pub coordinator: Option<Arc<Coordinator>>,
    /// Bearer token for the administrative endpoints. Unset disables them.
    pub admin_token: Option<String>,
    pub stream: StreamConfig,
}

impl AppState {
    pub fn new(
        scheduler: SchedulerHandle,
        store: Arc<dyn JobStore>,
        oracle: Arc<dyn AccessOracle>,
    ) -> Self {
        Self {
            scheduler,
            store,
            oracle,
            coordinator: None,
            admin_token: None,
            stream: StreamConfig::default(),
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }

    pub fn with_stream_config(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}
