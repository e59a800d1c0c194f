//! The orchestrator interface.
//!
//! The engine talks to its container substrate through [`Orchestrator`] so
//! the production Kubernetes client and the local/test broker are
//! interchangeable collaborators.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::spec::JobSpec;
use crate::error::Result;

/// Raw lifecycle counters reported by the orchestrator for one job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub active: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Coarse job phase derived from the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Completed,
    Failed,
    Running,
    Unknown,
}

impl JobStatusCounts {
    /// Collapse the counters into a phase. Order matters: a job that already
    /// succeeded stays completed even while pods linger.
    pub fn phase(&self) -> JobPhase {
        if self.succeeded >= 1 {
            JobPhase::Completed
        } else if self.failed >= 1 {
            JobPhase::Failed
        } else if self.active >= 1 {
            JobPhase::Running
        } else {
            JobPhase::Unknown
        }
    }
}

/// Identity of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: String,
    pub name: String,
}

/// One job as returned by a labeled listing.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: JobStatusCounts,
}

/// One pod as returned by a labeled listing.
#[derive(Debug, Clone)]
pub struct PodSummary {
    pub name: String,
}

/// Instantaneous resource usage of one container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerUsage {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

/// What the engine needs from a container orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit a job for execution.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle>;

    /// Current status of a job by name; `None` when the job no longer
    /// exists (deleted, e.g. by cancellation).
    async fn job_status(&self, name: &str) -> Result<Option<JobStatusCounts>>;

    /// List jobs matching a `k=v[,k=v]` label selector.
    async fn list_jobs(&self, selector: &str) -> Result<Vec<JobSummary>>;

    /// Delete a job, granting it `grace_seconds` to terminate; dependents
    /// are cleaned up in the background.
    async fn delete_job(&self, name: &str, grace_seconds: i64) -> Result<()>;

    /// List pods matching a `k=v[,k=v]` label selector.
    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSummary>>;

    /// Resource usage of one container of one pod, when the metrics source
    /// has it.
    async fn container_usage(&self, pod: &str, container: &str)
        -> Result<Option<ContainerUsage>>;
}

/// Match a label set against a `k=v[,k=v]` selector.
pub fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').all(|clause| {
        let clause = clause.trim();
        if clause.is_empty() {
            return true;
        }
        match clause.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(clause),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_precedence() {
        let completed = JobStatusCounts { active: 1, succeeded: 1, failed: 0 };
        assert_eq!(completed.phase(), JobPhase::Completed);

        let failed = JobStatusCounts { active: 0, succeeded: 0, failed: 2 };
        assert_eq!(failed.phase(), JobPhase::Failed);

        let running = JobStatusCounts { active: 1, succeeded: 0, failed: 0 };
        assert_eq!(running.phase(), JobPhase::Running);

        assert_eq!(JobStatusCounts::default().phase(), JobPhase::Unknown);
    }

    #[test]
    fn test_selector_matching() {
        let labels: BTreeMap<String, String> = [
            ("app".to_string(), "task-worker".to_string()),
            ("run-id".to_string(), "r1".to_string()),
        ]
        .into();

        assert!(selector_matches(&labels, "app=task-worker"));
        assert!(selector_matches(&labels, "app=task-worker,run-id=r1"));
        assert!(selector_matches(&labels, "run-id"));
        assert!(!selector_matches(&labels, "app=workflow-engine"));
        assert!(!selector_matches(&labels, "app=task-worker,run-id=r2"));
    }
}
