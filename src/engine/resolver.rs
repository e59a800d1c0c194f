//! Graph resolver.
//!
//! Materializes the task tree from a packed document: one child task per
//! workflow step, each bound to the process its step's `run` references.
//! No value propagation happens here; the scheduler reads the originating
//! step off each child when it runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::task::Task;
use crate::error::{Error, Result};
use crate::workflow::{PackedWorkflow, Process, ProcessClass, Step};

/// Build the task tree rooted at `entry`.
pub fn resolve_graph(doc: &PackedWorkflow, entry: &str) -> Result<Arc<Task>> {
    let index: BTreeMap<String, Arc<Process>> = doc
        .graph
        .iter()
        .map(|p| (p.id.clone(), Arc::new(p.clone())))
        .collect();

    let process = index
        .get(entry)
        .ok_or_else(|| Error::UnknownProcess(entry.to_string()))?
        .clone();

    let mut stack = Vec::new();
    build_task(&index, process, None, &mut stack)
}

fn build_task(
    index: &BTreeMap<String, Arc<Process>>,
    process: Arc<Process>,
    step: Option<Step>,
    stack: &mut Vec<String>,
) -> Result<Arc<Task>> {
    // a packed graph is a DAG; a process reaching itself is malformed
    if stack.iter().any(|id| id == &process.id) {
        return Err(Error::Validation(format!(
            "workflow graph cycle through {}",
            process.id
        )));
    }

    let mut children = BTreeMap::new();
    if process.class == ProcessClass::Workflow {
        stack.push(process.id.clone());
        for step in &process.steps {
            let child_process = index
                .get(&step.run)
                .ok_or_else(|| Error::UnknownProcess(step.run.clone()))?
                .clone();
            let child = build_task(index, child_process, Some(step.clone()), stack)?;
            children.insert(step.id.clone(), child);
        }
        stack.pop();
    }

    Ok(Task::new(process, step, children))
}
