//! Workflow engine.
//!
//! One [`Engine`] drives one run: it loads the packed workflow and inputs
//! from the run registry, materializes the task tree, executes it
//! concurrently, and mirrors the root task's fate into the run's log. All
//! collaborators (orchestrator, registry, configuration) are threaded in
//! explicitly so tests can substitute doubles.

mod dispatch;
mod outputs;
mod resolver;
mod scatter;
mod scheduler;
mod task;

pub use resolver::resolve_graph;
pub use task::{OutputMap, Task};

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jobs::{sanitize_label, Orchestrator, RUN_ID_LABEL};
use crate::metrics;
use crate::pack::ENTRYPOINT;
use crate::registry::{RunLogHandle, RunStatus, RunStore, TaskStatus};
use crate::workflow::{validate, PackedWorkflow, Parameters, ProcessClass};

/// Driver for a single run.
#[derive(Clone)]
pub struct Engine {
    broker: Arc<dyn Orchestrator>,
    store: RunStore,
    config: Arc<Config>,
    user_id: String,
    run_id: String,
    log: RunLogHandle,
}

impl Engine {
    /// Open the engine for an existing run.
    pub async fn open(
        broker: Arc<dyn Orchestrator>,
        store: RunStore,
        config: Arc<Config>,
        user_id: &str,
        run_id: &str,
    ) -> Result<Self> {
        let log = store.open_log(user_id, run_id).await?;
        Ok(Self {
            broker,
            store,
            config,
            user_id: user_id.to_string(),
            run_id: run_id.to_string(),
            log,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Drive the run to a terminal state and return the root workflow's
    /// outputs.
    pub async fn run(&self) -> Result<Parameters> {
        metrics::inc_active_runs();
        let result = self.drive().await;
        metrics::dec_active_runs();

        match &result {
            Ok(outputs) => {
                info!(run = %self.run_id, "run completed");
                let outputs = outputs.clone();
                self.log.update(|log| {
                    log.main.status = RunStatus::Completed;
                    log.main.end = Some(Utc::now());
                    log.main.output = Some(outputs);
                });
                metrics::record_run_finished("completed");
            }
            Err(Error::Cancelled) => {
                info!(run = %self.run_id, "run cancelled");
                self.log.update(|log| {
                    log.main.status = RunStatus::Cancelled;
                    log.main.end = Some(Utc::now());
                });
                metrics::record_run_finished("cancelled");
            }
            Err(e) => {
                error!(run = %self.run_id, "run failed: {e}");
                let message = e.to_string();
                self.log.update(|log| {
                    log.main.status = RunStatus::Failed;
                    log.main.end = Some(Utc::now());
                    log.main.error = Some(message);
                });
                metrics::record_run_finished("failed");
            }
        }
        if let Err(e) = self.log.flush().await {
            warn!(run = %self.run_id, "failed to flush final run log: {e}");
        }
        result
    }

    async fn drive(&self) -> Result<Parameters> {
        let document = self.store.workflow(&self.user_id, &self.run_id).await?;
        let doc: PackedWorkflow = serde_json::from_value(document)?;

        let report = validate(&doc);
        if !report.is_clean() {
            return Err(Error::Validation(serde_json::to_string(&report)?));
        }

        let root = resolve_graph(&doc, ENTRYPOINT)?;

        // workflow inputs arrive keyed by local name; qualify them into the
        // entry process namespace
        let inputs = self.store.input(&self.user_id, &self.run_id).await?;
        if let Some(bindings) = inputs.as_object() {
            for (key, value) in bindings {
                let id = if key.starts_with('#') {
                    key.clone()
                } else {
                    format!("{ENTRYPOINT}/{key}")
                };
                root.bind_parameter(&id, value.clone());
            }
        }
        let bound = root.parameters();
        for declared in &root.process.inputs {
            if !bound.contains_key(&declared.id) {
                if let Some(default) = &declared.default {
                    root.bind_parameter(&declared.id, default.clone());
                }
            }
        }

        self.init_task_logs(&root);
        self.log.update(|log| {
            log.main.status = RunStatus::Running;
            log.main.start = Some(Utc::now());
        });
        self.log.flush().await?;

        info!(run = %self.run_id, "running workflow job");
        self.run_task(root.clone()).await?;
        Ok(root.outputs.snapshot())
    }

    /// Run one task and settle its terminal state. This is the single place
    /// that closes a task's output map and flips its done flag, so waiters
    /// and the sampler always observe termination.
    pub(crate) fn run_task(&self, task: Arc<Task>) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        Box::pin(async move {
            let task_id = task.task_id();
            let result = engine.execute_task(&task).await;

            if let Err(e) = &result {
                let status = match e {
                    Error::Cancelled if task.process.class != ProcessClass::Workflow => {
                        TaskStatus::Cancelled
                    }
                    _ => TaskStatus::Failed,
                };
                // a step that never started keeps its notStarted entry
                if task.status() != TaskStatus::NotStarted {
                    task.set_status(status);
                    let message = e.to_string();
                    engine.log.task(&task_id, |t| {
                        if !t.status.is_terminal() {
                            t.status = status;
                        }
                        t.error.get_or_insert(message);
                        t.end.get_or_insert_with(Utc::now);
                    });
                }
            }

            task.outputs.close();
            task.mark_done();
            if let Err(e) = engine.log.flush().await {
                warn!(task = %task_id, "failed to flush run log: {e}");
            }
            result
        })
    }

    fn init_task_logs(&self, task: &Arc<Task>) {
        self.log
            .task(&task.task_id(), |t| t.status = TaskStatus::NotStarted);
        for child in task.children.values() {
            self.init_task_logs(child);
        }
    }
}

/// Cancel a run: delete the engine job and every task job labeled with the
/// run id, then mark the run record cancelled. In-flight activities observe
/// the deletions and settle as cancelled.
pub async fn cancel_run(
    broker: &dyn Orchestrator,
    store: &RunStore,
    user_id: &str,
    run_id: &str,
    grace_seconds: i64,
) -> Result<()> {
    let selector = format!("{}={}", RUN_ID_LABEL, sanitize_label(run_id));
    let jobs = broker.list_jobs(&selector).await?;
    info!(run = run_id, jobs = jobs.len(), "cancelling run");
    for job in jobs {
        if let Err(e) = broker.delete_job(&job.name, grace_seconds).await {
            warn!(job = %job.name, "error deleting job during cancel: {e}");
        }
    }
    store.mark_cancelled(user_id, run_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::LocalBroker;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: RunStore,
        broker: Arc<LocalBroker>,
        config: Arc<Config>,
    }

    const USER: &str = "alice";

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = RunStore::new(dir.path());
            let mut config = Config::default();
            config.engine.status_poll_millis = 20;
            config.storage.data_dir = Some(dir.path().to_path_buf());
            Self {
                _dir: dir,
                store,
                broker: Arc::new(LocalBroker::new()),
                config: Arc::new(config),
            }
        }

        async fn submit(&self, workflow: &Value, input: &Value) -> String {
            self.store.create_run(USER, workflow, input).await.unwrap()
        }

        async fn engine(&self, run_id: &str) -> Engine {
            Engine::open(
                self.broker.clone(),
                self.store.clone(),
                self.config.clone(),
                USER,
                run_id,
            )
            .await
            .unwrap()
        }

        async fn execute(&self, workflow: &Value, input: &Value) -> (String, Result<Parameters>) {
            let run_id = self.submit(workflow, input).await;
            let engine = self.engine(&run_id).await;
            let result = engine.run().await;
            (run_id, result)
        }
    }

    fn echo_tool() -> Value {
        json!({
            "id": "#echo.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["echo", "hello"],
            "inputs": [],
            "outputs": [{"id": "#echo.cwl/said", "type": "string"}]
        })
    }

    #[tokio::test]
    async fn test_scenario_hello() {
        let harness = Harness::new();
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [],
                    "outputs": [{
                        "id": "#main/message",
                        "type": "string",
                        "outputSource": "#main/hello/said"
                    }],
                    "steps": [{
                        "id": "#main/hello",
                        "run": "#echo.cwl",
                        "in": [],
                        "out": ["#main/hello/said"]
                    }]
                },
                echo_tool()
            ]
        });

        let (run_id, result) = harness.execute(&workflow, &json!({})).await;
        let outputs = result.unwrap();
        assert_eq!(outputs["#main/message"], json!("hello\n"));

        assert_eq!(
            harness.store.status(USER, &run_id).await.unwrap(),
            RunStatus::Completed
        );
        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        assert_eq!(log.by_task["#main/hello"].status, TaskStatus::Succeeded);
        assert!(log.by_task["#main/hello"].job_name.is_some());
    }

    #[tokio::test]
    async fn test_scenario_linear_dependency() {
        let harness = Harness::new();
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [],
                    "outputs": [{
                        "id": "#main/result",
                        "type": "int",
                        "outputSource": "#main/b/square"
                    }],
                    "steps": [
                        {
                            "id": "#main/a",
                            "run": "#emit.cwl",
                            "in": [],
                            "out": ["#main/a/n"]
                        },
                        {
                            "id": "#main/b",
                            "run": "#square.cwl",
                            "in": [{"id": "#main/b/n", "source": "#main/a/n"}],
                            "out": ["#main/b/square"]
                        }
                    ]
                },
                {
                    "id": "#emit.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", r#"echo "{\"n\": 3}""#],
                    "inputs": [],
                    "outputs": [{"id": "#emit.cwl/n", "type": "int"}]
                },
                {
                    "id": "#square.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", r#"echo "{\"square\": $(($0 * $0))}""#],
                    "inputs": [{
                        "id": "#square.cwl/n",
                        "type": "int",
                        "inputBinding": {"position": 1}
                    }],
                    "outputs": [{"id": "#square.cwl/square", "type": "int"}]
                }
            ]
        });

        let (run_id, result) = harness.execute(&workflow, &json!({})).await;
        let outputs = result.unwrap();
        assert_eq!(outputs["#main/result"], json!(9));

        // B started strictly after A finished
        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        let a_end = log.by_task["#main/a"].end.unwrap();
        let b_start = log.by_task["#main/b"].start.unwrap();
        assert!(b_start >= a_end, "b started before a ended");
    }

    #[tokio::test]
    async fn test_scenario_diamond() {
        let harness = Harness::new();
        let branch_tool = |id: &str, factor: u32| {
            json!({
                "id": id,
                "class": "CommandLineTool",
                "baseCommand": [
                    "/bin/sh", "-c",
                    format!(r#"sleep 0.3; echo "{{\"out\": $(($0 * {factor}))}}""#)
                ],
                "inputs": [{
                    "id": format!("{id}/n"),
                    "type": "int",
                    "inputBinding": {"position": 1}
                }],
                "outputs": [{"id": format!("{id}/out"), "type": "int"}]
            })
        };
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [],
                    "outputs": [{
                        "id": "#main/sum",
                        "type": "int",
                        "outputSource": "#main/d/sum"
                    }],
                    "steps": [
                        {"id": "#main/a", "run": "#emit.cwl", "in": [], "out": ["#main/a/n"]},
                        {
                            "id": "#main/b",
                            "run": "#b.cwl",
                            "in": [{"id": "#main/b/n", "source": "#main/a/n"}],
                            "out": ["#main/b/out"]
                        },
                        {
                            "id": "#main/c",
                            "run": "#c.cwl",
                            "in": [{"id": "#main/c/n", "source": "#main/a/n"}],
                            "out": ["#main/c/out"]
                        },
                        {
                            "id": "#main/d",
                            "run": "#sum.cwl",
                            "in": [
                                {"id": "#main/d/x", "source": "#main/b/out"},
                                {"id": "#main/d/y", "source": "#main/c/out"}
                            ],
                            "out": ["#main/d/sum"]
                        }
                    ]
                },
                {
                    "id": "#emit.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", r#"echo "{\"n\": 2}""#],
                    "inputs": [],
                    "outputs": [{"id": "#emit.cwl/n", "type": "int"}]
                },
                branch_tool("#b.cwl", 10),
                branch_tool("#c.cwl", 100),
                {
                    "id": "#sum.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", r#"echo "{\"sum\": $(($0 + $1))}""#],
                    "inputs": [
                        {"id": "#sum.cwl/x", "type": "int", "inputBinding": {"position": 1}},
                        {"id": "#sum.cwl/y", "type": "int", "inputBinding": {"position": 2}}
                    ],
                    "outputs": [{"id": "#sum.cwl/sum", "type": "int"}]
                }
            ]
        });

        let (run_id, result) = harness.execute(&workflow, &json!({})).await;
        let outputs = result.unwrap();
        assert_eq!(outputs["#main/sum"], json!(2 * 10 + 2 * 100));

        // B and C ran concurrently: their execution intervals overlap
        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        let b = &log.by_task["#main/b"];
        let c = &log.by_task["#main/c"];
        assert!(b.start.unwrap() < c.end.unwrap());
        assert!(c.start.unwrap() < b.end.unwrap());

        // D ran after both
        let d = &log.by_task["#main/d"];
        assert!(d.start.unwrap() >= b.end.unwrap());
        assert!(d.start.unwrap() >= c.end.unwrap());
    }

    #[tokio::test]
    async fn test_scenario_scatter_preserves_order() {
        let harness = Harness::new();
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [{
                        "id": "#main/xs",
                        "type": {"type": "array", "items": "int"}
                    }],
                    "outputs": [{
                        "id": "#main/doubled",
                        "type": {"type": "array", "items": "int"},
                        "outputSource": "#main/double/out"
                    }],
                    "steps": [{
                        "id": "#main/double",
                        "run": "#double.cwl",
                        "scatter": ["#main/double/n"],
                        "in": [{"id": "#main/double/n", "source": "#main/xs"}],
                        "out": ["#main/double/out"]
                    }]
                },
                {
                    "id": "#double.cwl",
                    "class": "CommandLineTool",
                    // later elements finish first; the gather must restore
                    // submission order
                    "baseCommand": [
                        "/bin/sh", "-c",
                        r#"sleep "0.$((5 - $0))"; echo "{\"out\": $(($0 * 2))}""#
                    ],
                    "inputs": [{
                        "id": "#double.cwl/n",
                        "type": "int",
                        "inputBinding": {"position": 1}
                    }],
                    "outputs": [{"id": "#double.cwl/out", "type": "int"}]
                }
            ]
        });

        let (run_id, result) = harness
            .execute(&workflow, &json!({"xs": [1, 2, 3, 4]}))
            .await;
        let outputs = result.unwrap();
        assert_eq!(outputs["#main/doubled"], json!([2, 4, 6, 8]));

        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        assert_eq!(log.by_task["#main/double"].status, TaskStatus::Succeeded);
        assert_eq!(log.by_task["#main/double[0]"].status, TaskStatus::Succeeded);
        assert_eq!(log.by_task["#main/double[3]"].status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_scenario_failure_propagation() {
        let harness = Harness::new();
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [],
                    "outputs": [{
                        "id": "#main/result",
                        "type": "int",
                        "outputSource": "#main/b/square"
                    }],
                    "steps": [
                        {"id": "#main/a", "run": "#boom.cwl", "in": [], "out": ["#main/a/n"]},
                        {
                            "id": "#main/b",
                            "run": "#square.cwl",
                            "in": [{"id": "#main/b/n", "source": "#main/a/n"}],
                            "out": ["#main/b/square"]
                        }
                    ]
                },
                {
                    "id": "#boom.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", "exit 1"],
                    "inputs": [],
                    "outputs": [{"id": "#boom.cwl/n", "type": "int"}]
                },
                {
                    "id": "#square.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", r#"echo "{\"square\": $(($0 * $0))}""#],
                    "inputs": [{
                        "id": "#square.cwl/n",
                        "type": "int",
                        "inputBinding": {"position": 1}
                    }],
                    "outputs": [{"id": "#square.cwl/square", "type": "int"}]
                }
            ]
        });

        let (run_id, result) = harness.execute(&workflow, &json!({})).await;
        assert!(result.is_err());

        // the run record is persisted with the failure
        assert_eq!(
            harness.store.status(USER, &run_id).await.unwrap(),
            RunStatus::Failed
        );
        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        assert_eq!(log.by_task["#main/a"].status, TaskStatus::Failed);
        assert_eq!(log.by_task["#main/b"].status, TaskStatus::NotStarted);
        assert!(log.main.error.is_some());
    }

    #[tokio::test]
    async fn test_scenario_cancellation() {
        let harness = Harness::new();
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [],
                    "outputs": [{
                        "id": "#main/out",
                        "type": "string",
                        "outputSource": "#main/slow/out"
                    }],
                    "steps": [{
                        "id": "#main/slow",
                        "run": "#sleep.cwl",
                        "in": [],
                        "out": ["#main/slow/out"]
                    }]
                },
                {
                    "id": "#sleep.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["/bin/sh", "-c", "sleep 30"],
                    "inputs": [],
                    "outputs": [{"id": "#sleep.cwl/out", "type": ["string", "null"]}]
                }
            ]
        });

        let run_id = harness.submit(&workflow, &json!({})).await;
        let engine = harness.engine(&run_id).await;
        let driver = tokio::spawn(async move { engine.run().await });

        // let the task job start, then cancel the run
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel_run(
            harness.broker.as_ref(),
            &harness.store,
            USER,
            &run_id,
            0,
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        assert_eq!(
            harness.store.status(USER, &run_id).await.unwrap(),
            RunStatus::Cancelled
        );

        // no orphan jobs remain labeled with this run id
        let selector = format!("{}={}", RUN_ID_LABEL, sanitize_label(&run_id));
        assert!(harness.broker.list_jobs(&selector).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_error_marks_run_failed() {
        let harness = Harness::new();
        // step references a process missing from the graph
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [{
                "id": "#main",
                "class": "Workflow",
                "inputs": [],
                "outputs": [],
                "steps": [{"id": "#main/s", "run": "#ghost.cwl", "in": [], "out": []}]
            }]
        });

        let (run_id, result) = harness.execute(&workflow, &json!({})).await;
        assert!(result.is_err());
        assert_eq!(
            harness.store.status(USER, &run_id).await.unwrap(),
            RunStatus::Failed
        );
        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        assert!(log.main.error.as_deref().unwrap().contains("#ghost.cwl"));
    }

    #[tokio::test]
    async fn test_workflow_output_never_changes_once_observed() {
        let harness = Harness::new();
        let workflow = json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [],
                    "outputs": [{
                        "id": "#main/message",
                        "type": "string",
                        "outputSource": "#main/hello/said"
                    }],
                    "steps": [{
                        "id": "#main/hello",
                        "run": "#echo.cwl",
                        "in": [],
                        "out": ["#main/hello/said"]
                    }]
                },
                echo_tool()
            ]
        });

        let run_id = harness.submit(&workflow, &json!({})).await;
        let engine = harness.engine(&run_id).await;
        let outputs = engine.run().await.unwrap();

        let first = outputs["#main/message"].clone();
        // the persisted record carries the same value
        let log = harness.store.read_log(USER, &run_id).await.unwrap();
        assert_eq!(log.main.output.as_ref().unwrap()["#main/message"], first);
    }
}
