//! Concurrent step scheduler.
//!
//! Every workflow task launches one activity per child step. An activity
//! binds its step's inputs (awaiting sibling outputs where a source refers
//! to another step), then runs its child task. The parent's own activity
//! gathers the workflow's declared outputs as they appear. The only
//! synchronization point is the await on a sibling's write-once output map.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::scatter::{build_shard_parameters, reshape};
use super::task::Task;
use super::Engine;
use crate::error::{Error, Result};
use crate::registry::TaskStatus;
use crate::workflow::{Process, ProcessClass, ScatterMethod, Step};

/// Map a step-scoped variable id onto the task (process) namespace:
/// `#main/step/x` under a step running `#tool.cwl` becomes `#tool.cwl/x`.
pub(crate) fn step_to_task_id(step: &Step, step_var_id: &str) -> String {
    let suffix = step_var_id.strip_prefix(step.id.as_str()).unwrap_or(step_var_id);
    format!("{}{}", step.run, suffix)
}

/// Index a workflow's declared step outputs: output id → producing step id.
pub(crate) fn output_id_map(process: &Process) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for step in &process.steps {
        for output in &step.outputs {
            map.insert(output.clone(), step.id.clone());
        }
    }
    map
}

impl Engine {
    /// Decide how to run one task: scatter fan-out, workflow recursion, or
    /// leaf dispatch.
    pub(crate) async fn execute_task(&self, task: &Arc<Task>) -> Result<()> {
        if !task.scatter().is_empty() {
            return self.run_scatter(task).await;
        }
        match task.process.class {
            ProcessClass::Workflow => self.run_workflow(task).await,
            _ => self.dispatch_tool(task).await,
        }
    }

    /// Run a workflow task: one concurrent activity per step, then gather.
    pub(crate) async fn run_workflow(&self, task: &Arc<Task>) -> Result<()> {
        let task_id = task.task_id();
        info!(task = %task_id, process = %task.process.id, "running workflow");

        task.set_status(TaskStatus::Running);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Running;
            t.start.get_or_insert_with(Utc::now);
        });

        let outputs_by_step = Arc::new(output_id_map(&task.process));

        let mut activities = JoinSet::new();
        for child in task.children.values() {
            let engine = self.clone();
            let parent = task.clone();
            let child = child.clone();
            let map = outputs_by_step.clone();
            activities.spawn(async move { engine.run_step(parent, child, map).await });
        }

        // collect declared outputs while the children run
        let gather_result = self.gather_outputs(task, &outputs_by_step).await;

        // a failed sibling never pre-empts the others: every activity runs
        // to completion so partial outputs stay observable
        let mut errors: Vec<Error> = Vec::new();
        while let Some(joined) = activities.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(Error::Execution(format!("step activity panicked: {e}"))),
            }
        }
        if let Err(e) = gather_result {
            errors.push(e);
        }

        if errors.is_empty() {
            task.set_status(TaskStatus::Succeeded);
            self.log.task(&task_id, |t| {
                t.status = TaskStatus::Succeeded;
                t.end = Some(Utc::now());
            });
            return Ok(());
        }
        // cancellation wins so it reaches the run status; otherwise report
        // the first failure
        if errors.iter().any(|e| matches!(e, Error::Cancelled)) {
            return Err(Error::Cancelled);
        }
        Err(errors.remove(0))
    }

    /// One step activity: bind inputs, record scatter, run the child.
    async fn run_step(
        &self,
        parent: Arc<Task>,
        child: Arc<Task>,
        outputs_by_step: Arc<BTreeMap<String, String>>,
    ) -> Result<()> {
        let step = child
            .step
            .clone()
            .ok_or_else(|| Error::Execution("child task has no originating step".into()))?;
        let task_id = child.task_id();
        debug!(step = %step.id, "processing step");

        child.set_status(TaskStatus::WaitingForInputs);
        self.log
            .task(&task_id, |t| t.status = TaskStatus::WaitingForInputs);

        let parent_params = parent.parameters();
        for input in &step.inputs {
            if input.source.len() > 1 {
                return Err(self.abort_step(&child, Error::MultipleSources(input.id.clone())));
            }
            let target = step_to_task_id(&step, &input.id);

            let Some(source) = input.source.first() else {
                if let Some(default) = &input.default {
                    child.bind_parameter(&target, default.clone());
                }
                continue;
            };

            if let Some(producer_step_id) = outputs_by_step.get(source) {
                // the source is another step's output: wait for it
                let sibling = match parent.children.get(producer_step_id) {
                    Some(sibling) => sibling,
                    None => {
                        return Err(
                            self.abort_step(&child, Error::UnknownSource(source.clone()))
                        )
                    }
                };
                let sibling_step = sibling
                    .step
                    .as_ref()
                    .ok_or_else(|| Error::Execution("sibling task has no step".into()))?;
                let output_id = step_to_task_id(sibling_step, source);

                debug!(step = %step.id, source = %source, "waiting for dependency step output");
                match sibling.outputs.wait_for(&output_id).await {
                    Ok(value) => child.bind_parameter(&target, value),
                    Err(_) => {
                        // the producer failed or was cancelled before
                        // publishing: this step never starts
                        child.set_status(TaskStatus::NotStarted);
                        self.log
                            .task(&task_id, |t| t.status = TaskStatus::NotStarted);
                        child.outputs.close();
                        child.mark_done();
                        return Err(Error::Execution(format!(
                            "step {} not started: upstream step {} produced no output",
                            step.id, producer_step_id
                        )));
                    }
                }
            } else if source.starts_with(&parent.process.id) {
                // the source is an input of the enclosing workflow
                match parent_params.get(source) {
                    Some(value) => child.bind_parameter(&target, value.clone()),
                    None => match parent.process.input(source) {
                        Some(declared) if declared.default.is_some() => {
                            child.bind_parameter(&target, declared.default.clone().unwrap_or(Value::Null));
                        }
                        Some(declared) if declared.is_optional() => {
                            child.bind_parameter(&target, Value::Null);
                        }
                        _ => {
                            return Err(self.abort_step(
                                &child,
                                Error::Execution(format!(
                                    "no value bound for workflow input {source}"
                                )),
                            ))
                        }
                    },
                }
            } else {
                return Err(self.abort_step(&child, Error::UnknownSource(source.clone())));
            }
        }

        if !step.scatter.is_empty() {
            let scatter_ids = step
                .scatter
                .iter()
                .map(|s| step_to_task_id(&step, s))
                .collect();
            child.set_scatter(scatter_ids);
        }

        child.set_status(TaskStatus::Ready);
        self.log.task(&task_id, |t| t.status = TaskStatus::Ready);

        self.run_task(child).await
    }

    /// Terminate a step that cannot run because of a resolution problem.
    fn abort_step(&self, child: &Arc<Task>, error: Error) -> Error {
        let task_id = child.task_id();
        child.set_status(TaskStatus::Failed);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Failed;
            t.error = Some(error.to_string());
            t.end = Some(Utc::now());
        });
        child.outputs.close();
        child.mark_done();
        error
    }

    /// Collect the workflow's declared outputs from the producing children.
    async fn gather_outputs(
        &self,
        task: &Arc<Task>,
        outputs_by_step: &BTreeMap<String, String>,
    ) -> Result<()> {
        for output in &task.process.outputs {
            match output.output_source.len() {
                0 => {
                    return Err(Error::Execution(format!(
                        "workflow output {} declares no outputSource",
                        output.id
                    )))
                }
                1 => {
                    let source = &output.output_source[0];
                    let value = if let Some(producer_step_id) = outputs_by_step.get(source) {
                        let child = task
                            .children
                            .get(producer_step_id)
                            .ok_or_else(|| Error::UnknownSource(source.clone()))?;
                        let child_step = child
                            .step
                            .as_ref()
                            .ok_or_else(|| Error::Execution("child task has no step".into()))?;
                        let output_id = step_to_task_id(child_step, source);
                        debug!(workflow = %task.process.id, source = %source, "waiting to merge child output");
                        child.outputs.wait_for(&output_id).await?
                    } else if source.starts_with(&task.process.id) {
                        // pass-through of a workflow input
                        task.parameters()
                            .get(source)
                            .cloned()
                            .ok_or_else(|| Error::UnknownSource(source.clone()))?
                    } else {
                        return Err(Error::UnknownSource(source.clone()));
                    };
                    task.outputs.publish(&output.id, value);
                }
                _ => return Err(Error::MultipleSources(output.id.clone())),
            }
        }
        Ok(())
    }

    /// Fan a scattered task out into shards and gather their outputs in
    /// shard order.
    pub(crate) async fn run_scatter(&self, task: &Arc<Task>) -> Result<()> {
        let task_id = task.task_id();
        task.set_status(TaskStatus::Running);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Running;
            t.start.get_or_insert_with(Utc::now);
        });

        let scatter_ids = task.scatter();
        let method = task.step.as_ref().and_then(|s| s.scatter_method);
        let (shard_params, dims) =
            build_shard_parameters(&task.parameters(), &scatter_ids, method)?;
        info!(task = %task_id, shards = shard_params.len(), "scattering task");

        let shards: Vec<Arc<Task>> = shard_params
            .into_iter()
            .enumerate()
            .map(|(index, params)| Task::shard(task, index, params))
            .collect();

        let mut activities = JoinSet::new();
        for shard in &shards {
            let engine = self.clone();
            let shard = shard.clone();
            activities.spawn(async move { engine.run_task(shard).await });
        }

        let mut errors: Vec<Error> = Vec::new();
        while let Some(joined) = activities.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(Error::Execution(format!("shard activity panicked: {e}"))),
            }
        }
        if !errors.is_empty() {
            if errors.iter().any(|e| matches!(e, Error::Cancelled)) {
                return Err(Error::Cancelled);
            }
            return Err(errors.remove(0));
        }

        // gather in shard-creation order, independent of completion order
        let nested = matches!(method, Some(ScatterMethod::NestedCrossproduct)) && dims.len() > 1;
        let mut gathered = Vec::with_capacity(task.process.outputs.len());
        for output in &task.process.outputs {
            let mut values = Vec::with_capacity(shards.len());
            for shard in &shards {
                let value = shard.outputs.get(&output.id).ok_or_else(|| {
                    Error::Execution(format!(
                        "scatter shard {:?} produced no output {}",
                        shard.scatter_index, output.id
                    ))
                })?;
                values.push(value);
            }
            let value = if nested {
                reshape(values, &dims)
            } else {
                Value::Array(values)
            };
            gathered.push((output.id.clone(), value));
        }

        // settle before publishing so waiters observe a finished task
        task.set_status(TaskStatus::Succeeded);
        self.log.task(&task_id, |t| {
            t.status = TaskStatus::Succeeded;
            t.end = Some(Utc::now());
        });
        for (id, value) in gathered {
            task.outputs.publish(&id, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_to_task_id_joins_namespaces() {
        let step: Step = serde_json::from_value(json!({
            "id": "#main/speak",
            "run": "#tool.cwl",
            "in": [],
            "out": []
        }))
        .unwrap();

        assert_eq!(
            step_to_task_id(&step, "#main/speak/message"),
            "#tool.cwl/message"
        );
        assert_eq!(step_to_task_id(&step, "#main/speak/said"), "#tool.cwl/said");
    }

    #[test]
    fn test_output_id_map() {
        let process: Process = serde_json::from_value(json!({
            "id": "#main",
            "class": "Workflow",
            "inputs": [],
            "outputs": [],
            "steps": [
                {"id": "#main/a", "run": "#t.cwl", "in": [], "out": ["#main/a/x", "#main/a/y"]},
                {"id": "#main/b", "run": "#t.cwl", "in": [], "out": ["#main/b/z"]}
            ]
        }))
        .unwrap();

        let map = output_id_map(&process);
        assert_eq!(map["#main/a/x"], "#main/a");
        assert_eq!(map["#main/a/y"], "#main/a");
        assert_eq!(map["#main/b/z"], "#main/b");
    }
}
