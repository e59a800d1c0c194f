//! Orchestrator-facing machinery: job specifications, the broker interface,
//! the Kubernetes and local brokers, the completed-job reaper, and the
//! per-task resource sampler.

mod broker;
mod k8s;
mod local;
pub mod reaper;
pub mod sampler;
mod spec;

pub use broker::{
    selector_matches, ContainerUsage, JobHandle, JobPhase, JobStatusCounts, JobSummary,
    Orchestrator, PodSummary,
};
pub use k8s::KubeBroker;
pub use local::{LocalBroker, STDOUT_FILE};
pub use spec::{
    build_command, engine_job_spec, job_name, localized, sanitize_label, task_job_spec, JobSpec,
    APP_LABEL, ENGINE_APP, ENGINE_CONTAINER, RUN_ID_LABEL, STEP_ID_LABEL, TASK_APP, TASK_CONTAINER,
};
