//! Build session protocol messages.
//!
//! Once a worker is reachable the controller opens a websocket to it and sends
//! a single [`SessionConfig`]. The worker then streams [`SessionMessage`]s, one
//! JSON object per text frame, ending with exactly one `final` message.

use serde::{Deserialize, Serialize};

use crate::RunId;
use crate::configuration::{BuildConfiguration, BuildInvocation, PushTarget, SourceSpec};
use crate::run::RunStatus;

/// The configuration payload sent to a worker right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub run_id: RunId,
    pub source: SourceSpec,
    pub invocation: BuildInvocation,
    pub push: PushTarget,
}

impl SessionConfig {
    pub fn for_run(run_id: RunId, config: &BuildConfiguration) -> Self {
        Self {
            run_id,
            source: config.source.clone(),
            invocation: config.invocation.clone(),
            push: config.push.clone(),
        }
    }
}

/// Terminal status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Success,
    Failure,
}

impl From<FinalStatus> for RunStatus {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Success => RunStatus::Success,
            FinalStatus::Failure => RunStatus::Failure,
        }
    }
}

/// Time spent in each build phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationBreakdown {
    #[serde(default)]
    pub fetch_ms: u64,
    #[serde(default)]
    pub build_ms: u64,
    #[serde(default)]
    pub push_ms: u64,
    #[serde(default)]
    pub total_ms: u64,
}

/// A message streamed by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionMessage {
    /// One line of build output.
    Output { line: String },
    /// Progress update; may carry the fetched source revision.
    StatusUpdate {
        status: String,
        #[serde(default)]
        revision: Option<String>,
    },
    /// Output the worker produced before the session was attached.
    InitialState {
        #[serde(default)]
        lines: Vec<String>,
    },
    /// Terminal message.
    Final {
        status: FinalStatus,
        #[serde(default)]
        durations: DurationBreakdown,
    },
}

impl SessionMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, SessionMessage::Final { .. })
    }

    /// Log lines this message contributes to the run log.
    pub fn log_lines(&self) -> Vec<&str> {
        match self {
            SessionMessage::Output { line } => vec![line.as_str()],
            SessionMessage::InitialState { lines } => lines.iter().map(String::as_str).collect(),
            SessionMessage::StatusUpdate { .. } | SessionMessage::Final { .. } => vec![],
        }
    }
}
