//! Engine metrics, exposed via the `/metrics` endpoint.
//!
//! ### Counters
//! - `skiff_runs_submitted_total` - run submissions accepted by the API
//! - `skiff_runs_finished_total` - engine-driven runs by final status
//! - `skiff_jobs_dispatched_total` - orchestrator jobs created, by kind
//! - `skiff_resource_samples_total` - resource usage points collected
//!
//! ### Gauges
//! - `skiff_active_runs` - runs currently driven by this process

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# metrics not initialized\n".to_string(),
    }
}

pub fn record_run_submitted() {
    counter!("skiff_runs_submitted_total").increment(1);
}

pub fn record_run_finished(status: &str) {
    counter!("skiff_runs_finished_total", "status" => status.to_string()).increment(1);
}

pub fn inc_active_runs() {
    gauge!("skiff_active_runs").increment(1.0);
}

pub fn dec_active_runs() {
    gauge!("skiff_active_runs").decrement(1.0);
}

pub fn record_job_dispatched(kind: &str) {
    counter!("skiff_jobs_dispatched_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_resource_sample() {
    counter!("skiff_resource_samples_total").increment(1);
}
