//! Runtime task tree.
//!
//! A [`Task`] is one process occurrence: the root submission, one node per
//! workflow step, and one per scatter shard. Concurrency contract:
//! `parameters` is written only by the single activity that owns the task,
//! `outputs` is a write-once map any number of sibling activities may await,
//! and `done` gates the resource sampler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{Error, Result};
use crate::registry::TaskStatus;
use crate::workflow::{Parameters, Process, Step};

/// One node of the task tree.
#[derive(Debug)]
pub struct Task {
    /// The process this task executes.
    pub process: Arc<Process>,

    /// The workflow step that created this task (`None` for the root).
    pub step: Option<Step>,

    /// Child tasks of a Workflow process, keyed by step id.
    pub children: BTreeMap<String, Arc<Task>>,

    /// Index of this shard within a scattered step.
    pub scatter_index: Option<usize>,

    /// Published outputs; write-once per key.
    pub outputs: OutputMap,

    /// Flips true exactly once, when the task reaches a terminal state.
    pub done: Arc<AtomicBool>,

    parameters: Mutex<Parameters>,
    scatter: Mutex<Vec<String>>,
    status: Mutex<TaskStatus>,
}

impl Task {
    pub fn new(
        process: Arc<Process>,
        step: Option<Step>,
        children: BTreeMap<String, Arc<Task>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            process,
            step,
            children,
            scatter_index: None,
            outputs: OutputMap::default(),
            done: Arc::new(AtomicBool::new(false)),
            parameters: Mutex::new(Parameters::new()),
            scatter: Mutex::new(Vec::new()),
            status: Mutex::new(TaskStatus::NotStarted),
        })
    }

    /// Derive one scatter shard: same process, one slice of the scattered
    /// inputs, no scatter metadata of its own. A scattered subworkflow gets
    /// a structurally identical child tree with fresh runtime state, so
    /// shards never share parameters or output maps.
    pub fn shard(parent: &Arc<Task>, index: usize, parameters: Parameters) -> Arc<Self> {
        Arc::new(Self {
            process: parent.process.clone(),
            step: parent.step.clone(),
            children: clone_structure(&parent.children),
            scatter_index: Some(index),
            outputs: OutputMap::default(),
            done: Arc::new(AtomicBool::new(false)),
            parameters: Mutex::new(parameters),
            scatter: Mutex::new(Vec::new()),
            status: Mutex::new(TaskStatus::NotStarted),
        })
    }

    /// Identifier used for logs and job naming: the originating step id when
    /// there is one, the process id otherwise, with the shard index appended
    /// for scatter shards.
    pub fn task_id(&self) -> String {
        let base = self
            .step
            .as_ref()
            .map(|s| s.id.as_str())
            .unwrap_or(&self.process.id);
        match self.scatter_index {
            Some(index) => format!("{base}[{index}]"),
            None => base.to_string(),
        }
    }

    pub fn bind_parameter(&self, id: &str, value: Value) {
        self.parameters
            .lock()
            .expect("task parameters lock poisoned")
            .insert(id.to_string(), value);
    }

    pub fn parameters(&self) -> Parameters {
        self.parameters
            .lock()
            .expect("task parameters lock poisoned")
            .clone()
    }

    pub fn set_scatter(&self, ids: Vec<String>) {
        *self.scatter.lock().expect("task scatter lock poisoned") = ids;
    }

    pub fn scatter(&self) -> Vec<String> {
        self.scatter
            .lock()
            .expect("task scatter lock poisoned")
            .clone()
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().expect("task status lock poisoned")
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock().expect("task status lock poisoned") = status;
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// Recreate a child tree with the same processes and steps but fresh
/// runtime state.
fn clone_structure(children: &BTreeMap<String, Arc<Task>>) -> BTreeMap<String, Arc<Task>> {
    children
        .iter()
        .map(|(step_id, child)| {
            (
                step_id.clone(),
                Task::new(
                    child.process.clone(),
                    child.step.clone(),
                    clone_structure(&child.children),
                ),
            )
        })
        .collect()
}

#[derive(Default, Debug)]
struct OutputState {
    values: Parameters,
    closed: bool,
}

/// Write-once output mapping with completion notification.
///
/// Waiters never poll: a publish or close wakes every parked waiter, and
/// once a key appears its value never changes. `close` marks that no further
/// keys will arrive, so waiters on a failed or cancelled producer observe an
/// error instead of parking forever.
#[derive(Default, Debug)]
pub struct OutputMap {
    state: Mutex<OutputState>,
    notify: Notify,
}

impl OutputMap {
    /// Publish one output. Re-publication of a key is ignored: outputs are
    /// immutable once observed.
    pub fn publish(&self, id: &str, value: Value) {
        {
            let mut state = self.state.lock().expect("output map lock poisoned");
            if state.values.contains_key(id) {
                warn!(output = id, "ignoring re-publication of output");
                return;
            }
            state.values.insert(id.to_string(), value);
        }
        self.notify.notify_waiters();
    }

    pub fn publish_all(&self, values: Parameters) {
        {
            let mut state = self.state.lock().expect("output map lock poisoned");
            for (id, value) in values {
                state.values.entry(id).or_insert(value);
            }
        }
        self.notify.notify_waiters();
    }

    /// No further outputs will arrive.
    pub fn close(&self) {
        self.state.lock().expect("output map lock poisoned").closed = true;
        self.notify.notify_waiters();
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.state
            .lock()
            .expect("output map lock poisoned")
            .values
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self) -> Parameters {
        self.state
            .lock()
            .expect("output map lock poisoned")
            .values
            .clone()
    }

    /// Await one output. Fails once the map is closed without the key, which
    /// is how waiters observe an upstream failure or cancellation.
    pub async fn wait_for(&self, id: &str) -> Result<Value> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a publish between the check and
            // the await cannot be missed
            notified.as_mut().enable();
            {
                let state = self.state.lock().expect("output map lock poisoned");
                if let Some(value) = state.values.get(id) {
                    return Ok(value.clone());
                }
                if state.closed {
                    return Err(Error::Execution(format!(
                        "output {id} will never be produced (producing task failed or was cancelled)"
                    )));
                }
            }
            notified.await;
        }
    }
}
