//! Run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConfigId, Error, RunId};

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
            RunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(RunStatus::Queued),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILURE" => Ok(RunStatus::Failure),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown run status: {}", other))),
        }
    }
}

/// One execution attempt of a build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    pub config_id: ConfigId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub log: String,
    pub revision: Option<String>,
}

/// A state transition written back to the job store.
///
/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub log: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub revision: Option<String>,
}

impl RunUpdate {
    /// A bare status change.
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            log: None,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            revision: None,
        }
    }

    /// Transition to `RUNNING`, stamping the start time.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::status(RunStatus::Running)
        }
    }

    /// Transition to a terminal status with the accumulated log.
    pub fn finished(
        status: RunStatus,
        log: String,
        started_at: Option<DateTime<Utc>>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = started_at.map(|s| (ended_at - s).num_milliseconds().max(0));
        Self {
            status,
            log: Some(log),
            started_at,
            ended_at: Some(ended_at),
            duration_ms,
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    /// Apply this update to a record in place.
    pub fn apply(&self, record: &mut RunRecord) {
        record.status = self.status;
        if let Some(log) = &self.log {
            record.log = log.clone();
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.ended_at.is_some() {
            record.ended_at = self.ended_at;
        }
        if self.duration_ms.is_some() {
            record.duration_ms = self.duration_ms;
        }
        if self.revision.is_some() {
            record.revision = self.revision.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> RunRecord {
        RunRecord {
            id: RunId::new(1),
            config_id: ConfigId::new(2),
            status: RunStatus::Queued,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            log: String::new(),
            revision: None,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_finished_update_computes_duration() {
        let start = Utc::now();
        let end = start + Duration::seconds(90);
        let update =
            RunUpdate::finished(RunStatus::Success, "ok\n".to_string(), Some(start), end);
        assert_eq!(update.duration_ms, Some(90_000));

        let mut rec = record();
        update.apply(&mut rec);
        assert_eq!(rec.status, RunStatus::Success);
        assert_eq!(rec.log, "ok\n");
        assert_eq!(rec.ended_at, Some(end));
    }

    #[test]
    fn test_status_update_keeps_existing_fields() {
        let mut rec = record();
        rec.log = "previous".to_string();
        rec.revision = Some("abc123".to_string());
        RunUpdate::status(RunStatus::Running).apply(&mut rec);
        assert_eq!(rec.log, "previous");
        assert_eq!(rec.revision.as_deref(), Some("abc123"));
    }
}
