//! Per-task resource usage sampler.
//!
//! While a leaf task is alive, one sampler task polls the orchestrator for
//! the job's pod and appends a `(t, cpu, mem)` point to the task's series.
//! Missing pods and missing metrics are non-fatal: the sampler records a
//! `(0, 0)` point with a diagnostic note so the time axis stays uniform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::broker::Orchestrator;
use super::spec::TASK_CONTAINER;
use crate::registry::{ResourceUsageSamplePoint, RunLogHandle};

/// Sample the task job's primary container until `done` flips to true,
/// flushing the run log after every sample.
pub async fn collect_resource_usage(
    broker: Arc<dyn Orchestrator>,
    log: RunLogHandle,
    task_id: String,
    job_name: String,
    done: Arc<AtomicBool>,
    period: Duration,
) {
    info!(task = %task_id, job = %job_name, "initiating resource usage monitoring");
    log.task(&task_id, |t| {
        t.stats.resource_usage.sampling_period_seconds = period.as_secs();
    });

    while !done.load(Ordering::SeqCst) {
        let (cpu, memory, note) = sample(broker.as_ref(), &job_name).await;
        debug!(task = %task_id, cpu, memory, "collected resource usage point");
        crate::metrics::record_resource_sample();
        log.task(&task_id, |t| {
            t.stats.resource_usage.series.push(ResourceUsageSamplePoint {
                timestamp: Utc::now(),
                cpu,
                memory,
                note,
            });
        });
        if let Err(e) = log.flush().await {
            warn!(task = %task_id, "failed to flush run log: {e}");
        }
        tokio::time::sleep(period).await;
    }

    log.task(&task_id, |t| {
        t.stats.resource_usage.collection_complete = true;
    });
    if let Err(e) = log.flush().await {
        warn!(task = %task_id, "failed to flush run log: {e}");
    }
    info!(task = %task_id, "task complete, exiting resource monitoring loop");
}

/// One sample: CPU in millicores, memory scaled to MB. `(0, 0)` plus a note
/// when the pod or metrics source is unavailable.
async fn sample(broker: &dyn Orchestrator, job_name: &str) -> (i64, i64, Option<String>) {
    let selector = format!("job-name={job_name}");
    let pods = match broker.list_pods(&selector).await {
        Ok(pods) => pods,
        Err(e) => return (0, 0, Some(format!("error fetching task pod: {e}"))),
    };

    match pods.len() {
        1 => match broker.container_usage(&pods[0].name, TASK_CONTAINER).await {
            Ok(Some(usage)) => (usage.cpu_millis, usage.memory_bytes / 1_000_000, None),
            Ok(None) => (0, 0, Some("metrics unavailable for task pod".to_string())),
            Err(e) => (0, 0, Some(format!("error fetching container metrics: {e}"))),
        },
        0 => (0, 0, Some("no pod found for task job".to_string())),
        n => (
            0,
            0,
            Some(format!("found {n} pods associated with task job")),
        ),
    }
}
