//! Controller configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Controller-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub dispatch: DispatchMode,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Shared secret guarding the administrative endpoints.
    pub refresh_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            refresh_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Where queued builds are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run builds in containers started by this controller.
    #[default]
    Local,
    /// Advertise builds to remote nodes over the message bus.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of live build workers.
    pub max_concurrency: usize,
    /// Image the build workers run.
    pub builder_image: String,
    /// Name prefix identifying builder processes.
    pub name_prefix: String,
    /// Container network the workers join.
    pub network: Option<String>,
    /// Port the worker's session socket listens on.
    pub session_port: u16,
    /// Handshake retries after the first failed attempt.
    pub handshake_retries: u32,
    /// Fixed delay between handshake attempts.
    pub handshake_delay: Duration,
    /// Recent output lines kept per worker for late listeners.
    pub output_buffer_lines: usize,
    /// Upper bound on the stored run log.
    pub max_log_bytes: usize,
    /// How long a stopped worker's socket may still deliver its final message.
    pub exit_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            builder_image: "ghcr.io/cachebuild/builder:latest".to_string(),
            name_prefix: "cachebuild-builder".to_string(),
            network: None,
            session_port: 8080,
            handshake_retries: 5,
            handshake_delay: Duration::from_secs(1),
            output_buffer_lines: 1000,
            max_log_bytes: 4 * 1024 * 1024,
            exit_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Time to keep relaying after a session ends.
    pub grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
        }
    }
}

/// Load controller configuration from a KDL file.
pub fn load_controller_config(path: impl AsRef<Path>) -> ConfigResult<ControllerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_controller_config(&content)
}

/// Parse controller configuration from KDL text.
pub fn parse_controller_config(kdl: &str) -> ConfigResult<ControllerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ControllerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => parse_server(node, &mut config.server)?,
            "database" => {
                if let Some(url) = get_string_prop(node, "url") {
                    config.database.url = Some(url);
                }
                if let Some(max) = get_int_prop(node, "max-connections") {
                    config.database.max_connections = to_u32("max-connections", max)?;
                }
            }
            "dispatch" => {
                let mode = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("dispatch mode".to_string()))?;
                config.dispatch = match mode.as_str() {
                    "local" => DispatchMode::Local,
                    "remote" => DispatchMode::Remote,
                    other => {
                        return Err(ConfigError::invalid(
                            "dispatch",
                            format!("expected \"local\" or \"remote\", got \"{}\"", other),
                        ));
                    }
                };
            }
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "stream" => {
                if let Some(ms) = get_int_prop(node, "grace-ms") {
                    config.stream.grace = to_millis("grace-ms", ms)?;
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_server(node: &KdlNode, server: &mut ServerConfig) -> ConfigResult<()> {
    if let Some(listen) = get_string_prop(node, "listen") {
        server.listen = listen
            .parse()
            .map_err(|e| ConfigError::invalid("listen", format!("{}: {}", listen, e)))?;
    }
    if let Some(token) = get_string_prop(node, "refresh-token") {
        if token.is_empty() {
            return Err(ConfigError::invalid("refresh-token", "must not be empty"));
        }
        server.refresh_token = Some(token);
    }
    Ok(())
}

fn parse_scheduler(node: &KdlNode, scheduler: &mut SchedulerConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "max-concurrency" => {
                let value = get_first_int_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
                if value < 1 {
                    return Err(ConfigError::invalid(field, "must be at least 1"));
                }
                scheduler.max_concurrency = to_u32(field, value)? as usize;
            }
            "builder-image" => {
                scheduler.builder_image = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
            }
            "name-prefix" => {
                scheduler.name_prefix = get_first_string_arg(child)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
            }
            "network" => {
                scheduler.network = get_first_string_arg(child);
            }
            "session-port" => {
                let value = get_first_int_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
                scheduler.session_port = u16::try_from(value)
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ConfigError::invalid(field, "must be a non-zero port"))?;
            }
            "handshake" => {
                if let Some(retries) = get_int_prop(child, "retries") {
                    scheduler.handshake_retries = to_u32("handshake retries", retries)?;
                }
                if let Some(ms) = get_int_prop(child, "delay-ms") {
                    scheduler.handshake_delay = to_millis("handshake delay-ms", ms)?;
                }
            }
            "output-buffer-lines" => {
                let value = get_first_int_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
                scheduler.output_buffer_lines = to_u32(field, value)? as usize;
            }
            "max-log-bytes" => {
                let value = get_first_int_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
                scheduler.max_log_bytes = usize::try_from(value)
                    .map_err(|_| ConfigError::invalid(field, "must be non-negative"))?;
            }
            "exit-grace-ms" => {
                let value = get_first_int_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
                scheduler.exit_grace = to_millis(field, value)?;
            }
            _ => {}
        }
    }

    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn to_u32(field: &str, value: i128) -> ConfigResult<u32> {
    u32::try_from(value).map_err(|_| ConfigError::invalid(field, format!("out of range: {}", value)))
}

fn to_millis(field: &str, value: i128) -> ConfigResult<Duration> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::invalid(field, "must be non-negative"))
}
