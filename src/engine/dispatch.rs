//! Leaf task dispatch.
//!
//! For each leaf the engine builds a job specification from the process and
//! its resource hints, submits it, starts the resource sampler, then polls
//! the orchestrator until a terminal state. On success the declared outputs
//! are captured from the task working directory and published; on failure
//! the orchestrator-reported reason lands in the task log and the error
//! propagates up the gather path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::outputs::capture_outputs;
use super::task::Task;
use super::Engine;
use crate::error::{Error, Result};
use crate::jobs::{sampler, task_job_spec, JobPhase};
use crate::metrics;
use crate::registry::TaskStatus;

impl Engine {
    /// Run one leaf task to completion as an orchestrator job.
    pub(crate) async fn dispatch_tool(&self, task: &Arc<Task>) -> Result<()> {
        let task_id = task.task_id();
        info!(task = %task_id, process = %task.process.id, "dispatching task");

        task.set_status(TaskStatus::Ready);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Ready;
            t.start.get_or_insert_with(Utc::now);
        });

        let working_dir = self
            .store
            .working_dir(&self.user_id, &self.run_id)?
            .join(task_dir_name(&task_id));
        tokio::fs::create_dir_all(&working_dir).await?;

        let spec = task_job_spec(
            &self.config,
            &self.run_id,
            &task_id,
            &task.process,
            &task.parameters(),
            working_dir.clone(),
            self.store.root().to_path_buf(),
        )?;

        let handle = self.broker.submit(&spec).await?;
        metrics::record_job_dispatched("task");

        task.set_status(TaskStatus::Dispatched);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Dispatched;
            t.job_id = Some(handle.id.clone());
            t.job_name = Some(handle.name.clone());
        });
        if let Err(e) = self.log.flush().await {
            warn!(task = %task_id, "failed to flush run log: {e}");
        }

        tokio::spawn(sampler::collect_resource_usage(
            self.broker.clone(),
            self.log.clone(),
            task_id.clone(),
            handle.name.clone(),
            task.done.clone(),
            self.config.engine.sampling_period(),
        ));

        self.observe_to_completion(task, &task_id, &handle.name).await?;

        let outputs = capture_outputs(&task.process, &working_dir)?;
        // settle the terminal state before publishing: the publish wakes
        // downstream waiters, and they must observe this task as finished
        task.set_status(TaskStatus::Succeeded);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Succeeded;
            t.end = Some(Utc::now());
        });
        task.outputs.publish_all(outputs);
        info!(task = %task_id, "task succeeded");
        Ok(())
    }

    /// Poll the orchestrator until the job reaches a terminal state.
    async fn observe_to_completion(
        &self,
        task: &Arc<Task>,
        task_id: &str,
        job_name: &str,
    ) -> Result<()> {
        let poll_period = self.config.engine.status_poll_period();
        let timeout = self.config.engine.task_timeout_seconds;
        let deadline = Instant::now() + Duration::from_secs(timeout);
        let mut seen_running = false;

        loop {
            if Instant::now() >= deadline {
                warn!(task = %task_id, job = %job_name, "task exceeded wall-clock limit, deleting job");
                let _ = self.broker.delete_job(job_name, 0).await;
                return Err(Error::Timeout(timeout));
            }

            match self.broker.job_status(job_name).await? {
                // the job disappeared underneath us: a cancel request
                // deleted it
                None => {
                    info!(task = %task_id, job = %job_name, "task job deleted, treating as cancelled");
                    return Err(Error::Cancelled);
                }
                Some(counts) => match counts.phase() {
                    JobPhase::Completed => {
                        debug!(task = %task_id, "job completed");
                        return Ok(());
                    }
                    JobPhase::Failed => {
                        return Err(Error::Execution(format!(
                            "job {job_name} failed (active={}, succeeded={}, failed={})",
                            counts.active, counts.succeeded, counts.failed
                        )));
                    }
                    JobPhase::Running => {
                        if !seen_running {
                            seen_running = true;
                            task.set_status(TaskStatus::Running);
                            self.log.task(task_id, |t| t.status = TaskStatus::Running);
                        }
                    }
                    JobPhase::Unknown => {}
                },
            }
            tokio::time::sleep(poll_period).await;
        }
    }
}

/// Filesystem-safe directory name for one task's working directory.
fn task_dir_name(task_id: &str) -> String {
    task_id
        .trim_start_matches('#')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '[' || c == ']' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
