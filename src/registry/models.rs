//! Run registry models.
//!
//! The log shapes here are the persisted API contract: `log.json` under each
//! run directory, returned verbatim by `GET /runs/{runID}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::Parameters;

/// Top-level run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Per-task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    WaitingForInputs,
    Ready,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "notStarted"),
            Self::WaitingForInputs => write!(f, "waitingForInputs"),
            Self::Ready => write!(f, "ready"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The full log of a run: one entry for the run itself plus one per task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MainLog {
    #[serde(default)]
    pub main: RunLogEntry,

    #[serde(rename = "byTask", default)]
    pub by_task: BTreeMap<String, TaskLog>,
}

/// Run-level log entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    /// Gathered root workflow outputs, present once the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Parameters>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-task log entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub stats: TaskStats,
}

/// Resource accounting attached to a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub resource_usage: ResourceUsage,
}

/// A per-task resource usage time series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub series: Vec<ResourceUsageSamplePoint>,

    #[serde(default)]
    pub sampling_period_seconds: u64,

    /// Set once the sampler has exited.
    #[serde(default)]
    pub collection_complete: bool,
}

/// One `(t, cpu, mem)` sample. CPU in millicores, memory in MB. `(0, 0)` is
/// the nil value recorded when the pod or metrics source was unavailable, so
/// the time axis stays uniform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsageSamplePoint {
    pub timestamp: DateTime<Utc>,
    pub cpu: i64,
    pub memory: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A staged data object referenced by a run submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "object_id")]
    pub object_id: String,
}

/// Body of `POST /runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow: Value,

    pub input: Value,

    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,

    /// Legacy identity field; the authenticated token wins when present.
    #[serde(default)]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(RunStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
        assert_eq!(
            serde_json::to_value(TaskStatus::WaitingForInputs).unwrap(),
            serde_json::json!("waitingForInputs")
        );
        assert_eq!(
            serde_json::to_value(TaskStatus::NotStarted).unwrap(),
            serde_json::json!("notStarted")
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::NotStarted.is_terminal());
    }

    #[test]
    fn test_log_round_trip() {
        let mut log = MainLog::default();
        log.main.status = RunStatus::Running;
        log.by_task.insert(
            "#main/step".to_string(),
            TaskLog {
                status: TaskStatus::Running,
                job_name: Some("task-abc".to_string()),
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["main"]["status"], "running");
        assert_eq!(json["byTask"]["#main/step"]["jobName"], "task-abc");

        let back: MainLog = serde_json::from_value(json).unwrap();
        assert_eq!(back.by_task["#main/step"].status, TaskStatus::Running);
    }
}
