//! Run registry: per-(user, run) persistence of workflow, inputs, and log.

mod models;
mod store;

pub use models::{
    MainLog, ManifestEntry, ResourceUsage, ResourceUsageSamplePoint, RunLogEntry, RunRequest,
    RunStatus, TaskLog, TaskStats, TaskStatus,
};
pub use store::{RunLogHandle, RunStore};
