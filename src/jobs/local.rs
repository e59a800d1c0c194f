//! Local process broker.
//!
//! Runs job specs as child processes on this machine: the container image is
//! ignored, the command runs directly in the task working directory, and
//! stdout is captured to the same `stdout` file output capture reads. Used
//! by `skiff run --local` for development and by the end-to-end tests, which
//! drive the whole engine without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::broker::{
    selector_matches, ContainerUsage, JobHandle, JobStatusCounts, JobSummary, Orchestrator,
    PodSummary,
};
use super::spec::JobSpec;
use crate::error::{Error, Result};

/// File in the task working directory receiving the job's stdout.
pub const STDOUT_FILE: &str = "stdout";

struct LocalJob {
    id: String,
    labels: BTreeMap<String, String>,
    status: Arc<Mutex<JobStatusCounts>>,
    cancel: Option<oneshot::Sender<()>>,
}

/// [`Orchestrator`] that spawns local child processes.
#[derive(Clone, Default)]
pub struct LocalBroker {
    jobs: Arc<Mutex<HashMap<String, LocalJob>>>,
    next_id: Arc<AtomicU64>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Orchestrator for LocalBroker {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::Dispatch(format!("job {} has an empty command", spec.name)))?;

        std::fs::create_dir_all(&spec.working_dir)?;
        let stdout = std::fs::File::create(spec.working_dir.join(STDOUT_FILE))?;

        let mut child = Command::new(program)
            .args(args)
            .envs(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Dispatch(format!("failed to spawn {program}: {e}")))?;

        let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let status = Arc::new(Mutex::new(JobStatusCounts {
            active: 1,
            ..Default::default()
        }));
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        {
            let status = status.clone();
            let name = spec.name.clone();
            tokio::spawn(async move {
                tokio::select! {
                    exit = child.wait() => {
                        let mut counts = status.lock().expect("job status lock poisoned");
                        counts.active = 0;
                        match exit {
                            Ok(code) if code.success() => counts.succeeded = 1,
                            Ok(_) | Err(_) => counts.failed = 1,
                        }
                    }
                    _ = &mut cancel_rx => {
                        debug!(job = %name, "killing local job");
                        if let Err(e) = child.kill().await {
                            warn!(job = %name, "failed to kill local job: {e}");
                        }
                        let mut counts = status.lock().expect("job status lock poisoned");
                        counts.active = 0;
                    }
                }
            });
        }

        self.jobs.lock().expect("jobs lock poisoned").insert(
            spec.name.clone(),
            LocalJob {
                id: id.clone(),
                labels: spec.labels.clone(),
                status,
                cancel: Some(cancel_tx),
            },
        );

        debug!(job = %spec.name, "local job started");
        Ok(JobHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn job_status(&self, name: &str) -> Result<Option<JobStatusCounts>> {
        let jobs = self.jobs.lock().expect("jobs lock poisoned");
        Ok(jobs
            .get(name)
            .map(|job| *job.status.lock().expect("job status lock poisoned")))
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<JobSummary>> {
        let jobs = self.jobs.lock().expect("jobs lock poisoned");
        Ok(jobs
            .iter()
            .filter(|(_, job)| selector_matches(&job.labels, selector))
            .map(|(name, job)| JobSummary {
                id: job.id.clone(),
                name: name.clone(),
                labels: job.labels.clone(),
                status: *job.status.lock().expect("job status lock poisoned"),
            })
            .collect())
    }

    async fn delete_job(&self, name: &str, _grace_seconds: i64) -> Result<()> {
        let removed = self.jobs.lock().expect("jobs lock poisoned").remove(name);
        if let Some(mut job) = removed {
            if let Some(cancel) = job.cancel.take() {
                let _ = cancel.send(());
            }
        }
        Ok(())
    }

    async fn list_pods(&self, _selector: &str) -> Result<Vec<PodSummary>> {
        // local jobs have no pods; the sampler records (0, 0) points
        Ok(Vec::new())
    }

    async fn container_usage(
        &self,
        _pod: &str,
        _container: &str,
    ) -> Result<Option<ContainerUsage>> {
        Ok(None)
    }
}
