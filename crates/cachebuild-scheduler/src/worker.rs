//! Live build workers as seen by the scheduler.

use cachebuild_core::session::{SessionConfig, SessionMessage};
use cachebuild_core::{ConfigId, RunId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Marker appended once the stored log hits its size limit.
pub const LOG_TRUNCATED_MARKER: &str = "[cachebuild] log truncated";

/// State of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Process start requested, address not known yet.
    Provisioning,
    /// Address known, session handshake in progress.
    Connected,
    /// Session established and delivering messages.
    Streaming,
    Completed,
    Failed,
}

/// Most recent session messages of a worker, for listeners that attach late.
#[derive(Debug)]
pub struct OutputBuffer {
    messages: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, message: String) {
        if self.capacity == 0 {
            return;
        }
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Run log text with an upper size bound.
#[derive(Debug)]
pub struct RunLog {
    text: String,
    max_bytes: usize,
    truncated: bool,
}

impl RunLog {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    pub fn append_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 > self.max_bytes {
            self.truncated = true;
            self.text.push_str(LOG_TRUNCATED_MARKER);
            self.text.push('\n');
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    /// Append a closing line, ignoring the size bound.
    pub fn append_trailer(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Runtime handle to one build worker. Never persisted.
#[derive(Debug)]
pub struct WorkerHandle {
    pub config_id: ConfigId,
    pub run_id: RunId,
    pub state: WorkerState,
    pub process_id: Option<String>,
    pub address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub revision: Option<String>,
    /// Set once the runtime reported the process stopped.
    pub exited: bool,
    /// Payload handed to the worker once its session opens.
    pub session_config: SessionConfig,
    pub output: OutputBuffer,
    pub log: RunLog,
    /// Fan-out of raw session messages to stream listeners.
    pub listeners: broadcast::Sender<String>,
    /// Task owning the session socket.
    pub session: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(
        config_id: ConfigId,
        session_config: SessionConfig,
        output_lines: usize,
        max_log_bytes: usize,
    ) -> Self {
        let (listeners, _) = broadcast::channel(output_lines.clamp(16, 4096));
        Self {
            config_id,
            run_id: session_config.run_id,
            state: WorkerState::Provisioning,
            process_id: None,
            address: None,
            started_at: Utc::now(),
            revision: None,
            exited: false,
            session_config,
            output: OutputBuffer::new(output_lines),
            log: RunLog::new(max_log_bytes),
            listeners,
            session: None,
        }
    }

    /// Record one raw session message.
    ///
    /// The message is buffered and relayed verbatim. Returns the parsed form,
    /// or `None` when it is not a valid session message.
    pub fn record(&mut self, raw: String) -> Option<SessionMessage> {
        let parsed = match SessionMessage::parse(&raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Malformed session message");
                None
            }
        };

        if let Some(message) = &parsed {
            for line in message.log_lines() {
                self.log.append_line(line);
            }
            if let SessionMessage::StatusUpdate {
                revision: Some(revision),
                ..
            } = message
            {
                self.revision = Some(revision.clone());
            }
        }

        self.output.push(raw.clone());
        // No receivers just means nobody is watching.
        let _ = self.listeners.send(raw);
        parsed
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.abort();
        }
    }
}
