//! Background job reaper.
//!
//! Lists every job carrying this system's labels and deletes the ones the
//! orchestrator reports terminal-completed; their logs and outputs were
//! already collected the moment they finished. Failed jobs are deliberately
//! left behind for inspection.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::broker::{JobPhase, Orchestrator};
use super::spec::{APP_LABEL, ENGINE_APP, TASK_APP};
use crate::shutdown::ShutdownCoordinator;

/// Run the reaper until shutdown: every `period`, delete completed jobs with
/// the configured grace.
pub async fn reap_completed_jobs(
    broker: Arc<dyn Orchestrator>,
    period: Duration,
    grace_seconds: i64,
    shutdown: ShutdownCoordinator,
) {
    info!("job reaper started");
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            _ = tokio::time::sleep(period) => {}
        }
        sweep(broker.as_ref(), grace_seconds).await;
    }
    info!("job reaper stopped");
}

/// One reaper pass over task and engine jobs.
pub async fn sweep(broker: &dyn Orchestrator, grace_seconds: i64) {
    for app in [TASK_APP, ENGINE_APP] {
        let selector = format!("{APP_LABEL}={app}");
        let jobs = match broker.list_jobs(&selector).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(selector = %selector, "jobs monitoring error: {e}");
                continue;
            }
        };
        for job in jobs {
            if job.status.phase() != JobPhase::Completed {
                continue;
            }
            match broker.delete_job(&job.name, grace_seconds).await {
                Ok(()) => debug!(job = %job.name, "deleted completed job"),
                Err(e) => warn!(job = %job.name, "error deleting job: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::broker::JobPhase;
    use crate::jobs::local::LocalBroker;
    use crate::jobs::spec::JobSpec;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn spec(name: &str, app: &str, command: &[&str], dir: PathBuf) -> JobSpec {
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), app.to_string());
        labels.insert("run-id".to_string(), "r1".to_string());
        JobSpec {
            name: name.to_string(),
            labels,
            image: "ignored".to_string(),
            container_name: "task-container".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            working_dir: dir,
            mount: None,
            cores_min: None,
            ram_min_mb: None,
        }
    }

    async fn wait_terminal(broker: &LocalBroker, name: &str) {
        for _ in 0..200 {
            if let Some(counts) = broker.job_status(name).await.unwrap() {
                if counts.phase() != JobPhase::Running {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {name} never finished");
    }

    #[tokio::test]
    async fn test_sweep_deletes_completed_keeps_failed() {
        let dir = TempDir::new().unwrap();
        let broker = LocalBroker::new();

        broker
            .submit(&spec("job-ok", TASK_APP, &["true"], dir.path().join("ok")))
            .await
            .unwrap();
        broker
            .submit(&spec(
                "job-bad",
                TASK_APP,
                &["/bin/sh", "-c", "exit 1"],
                dir.path().join("bad"),
            ))
            .await
            .unwrap();
        wait_terminal(&broker, "job-ok").await;
        wait_terminal(&broker, "job-bad").await;

        sweep(&broker, 0).await;

        // the completed job is gone, the failed one remains for inspection
        assert!(broker.job_status("job-ok").await.unwrap().is_none());
        assert!(broker.job_status("job-bad").await.unwrap().is_some());
    }
}
