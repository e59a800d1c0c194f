//! Orchestrator job specifications.
//!
//! A [`JobSpec`] is the broker-independent description of one container job:
//! the engine builds one per leaf task (and one per run for the engine pod),
//! and brokers translate it into their own manifest format.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::workflow::{local_name, Argument, Parameters, Process, ProcessClass};

/// Label key identifying what kind of job this is.
pub const APP_LABEL: &str = "app";
/// Label value for leaf task jobs.
pub const TASK_APP: &str = "task-worker";
/// Label value for per-run engine jobs.
pub const ENGINE_APP: &str = "workflow-engine";
/// Label carrying the run id on every job this system creates.
pub const RUN_ID_LABEL: &str = "run-id";
/// Label carrying the originating step on task jobs.
pub const STEP_ID_LABEL: &str = "step-id";
/// Well-known name of the task container inside its pod.
pub const TASK_CONTAINER: &str = "task-container";
/// Name of the engine container.
pub const ENGINE_CONTAINER: &str = "engine-container";

/// A container job, ready to hand to an [`super::Orchestrator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job name (DNS label syntax).
    pub name: String,

    pub labels: BTreeMap<String, String>,

    pub image: String,

    pub container_name: String,

    pub command: Vec<String>,

    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Directory the container starts in.
    pub working_dir: PathBuf,

    /// Shared data root to bind-mount at the same path inside the container
    /// (presented on the host by the object-store sidecar).
    #[serde(default)]
    pub mount: Option<PathBuf>,

    #[serde(default)]
    pub cores_min: Option<f64>,

    #[serde(default)]
    pub ram_min_mb: Option<i64>,
}

/// Build the job specification for a leaf task.
pub fn task_job_spec(
    config: &Config,
    run_id: &str,
    task_id: &str,
    process: &Process,
    params: &Parameters,
    working_dir: PathBuf,
    mount: PathBuf,
) -> Result<JobSpec> {
    let image = match process.class {
        ProcessClass::ExpressionTool => config.orchestrator.expression_image.clone(),
        _ => process
            .docker_image()
            .unwrap_or(&config.orchestrator.task_image)
            .to_string(),
    };
    let command = build_command(process, params)?;
    let (cores_min, ram_min_mb) = process.resource_floor();

    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), TASK_APP.to_string());
    labels.insert(RUN_ID_LABEL.to_string(), sanitize_label(run_id));
    labels.insert(STEP_ID_LABEL.to_string(), sanitize_label(task_id));

    Ok(JobSpec {
        name: job_name("task", run_id, task_id),
        labels,
        image,
        container_name: TASK_CONTAINER.to_string(),
        command,
        env: Vec::new(),
        working_dir,
        mount: Some(mount),
        cores_min,
        ram_min_mb,
    })
}

/// Build the job specification for the engine pod that drives one run.
pub fn engine_job_spec(config: &Config, user_id: &str, run_id: &str, mount: PathBuf) -> JobSpec {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), ENGINE_APP.to_string());
    labels.insert(RUN_ID_LABEL.to_string(), sanitize_label(run_id));

    let mut command = vec![
        "skiff".to_string(),
        "run".to_string(),
        run_id.to_string(),
        "--user".to_string(),
        user_id.to_string(),
    ];
    if config.orchestrator.local {
        command.push("--local".to_string());
    }

    JobSpec {
        name: job_name("engine", run_id, "engine"),
        labels,
        image: config.orchestrator.engine_image.clone(),
        container_name: ENGINE_CONTAINER.to_string(),
        command,
        env: vec![
            ("GEN3_NAMESPACE".to_string(), config.orchestrator.namespace.clone()),
            ("SKIFF_DATA_DIR".to_string(), mount.display().to_string()),
        ],
        working_dir: mount.clone(),
        mount: Some(mount),
        cores_min: None,
        ram_min_mb: None,
    }
}

/// Assemble the container invocation for a leaf process.
pub fn build_command(process: &Process, params: &Parameters) -> Result<Vec<String>> {
    match process.class {
        ProcessClass::CommandLineTool => build_tool_command(process, params),
        ProcessClass::ExpressionTool => build_expression_command(process, params),
        ProcessClass::Workflow => Err(Error::Dispatch(format!(
            "{} is a Workflow, not a dispatchable leaf",
            process.id
        ))),
    }
}

fn build_tool_command(process: &Process, params: &Parameters) -> Result<Vec<String>> {
    let mut command: Vec<String> = process.base_command.clone();

    for argument in &process.arguments {
        match argument {
            Argument::Literal(s) => command.push(substitute_inputs(s, process, params)),
            Argument::Binding(binding) => {
                if let Some(prefix) = &binding.prefix {
                    command.push(prefix.clone());
                }
                if let Some(value_from) = &binding.value_from {
                    command.push(substitute_inputs(value_from, process, params));
                }
            }
        }
    }

    // inputs with a binding, ordered by position (ties broken by id so the
    // order is deterministic)
    let mut bound: Vec<_> = process
        .inputs
        .iter()
        .filter_map(|p| p.input_binding.as_ref().map(|b| (b, p)))
        .collect();
    bound.sort_by(|(a, pa), (b, pb)| {
        let pos_a = a.position.unwrap_or(0);
        let pos_b = b.position.unwrap_or(0);
        pos_a.cmp(&pos_b).then_with(|| pa.id.cmp(&pb.id))
    });

    for (binding, param) in bound {
        let value = match params.get(&param.id).or(param.default.as_ref()) {
            Some(v) => v.clone(),
            None if param.is_optional() => continue,
            None => {
                return Err(Error::Dispatch(format!(
                    "missing required input {}",
                    param.id
                )))
            }
        };
        if value.is_null() {
            continue;
        }
        // boolean bindings are flags: emit the prefix iff true
        if let Value::Bool(flag) = value {
            if flag {
                if let Some(prefix) = &binding.prefix {
                    command.push(prefix.clone());
                }
            }
            continue;
        }
        if let Some(prefix) = &binding.prefix {
            command.push(prefix.clone());
        }
        command.extend(render_value(&value));
    }

    if command.is_empty() {
        return Err(Error::Dispatch(format!("{} has no command", process.id)));
    }
    Ok(command)
}

/// ExpressionTools run inside their container as a node one-liner that binds
/// the inputs object and prints the expression result as JSON on stdout,
/// which is exactly where output capture looks.
fn build_expression_command(process: &Process, params: &Parameters) -> Result<Vec<String>> {
    let expression = process
        .expression
        .as_deref()
        .ok_or_else(|| Error::Dispatch(format!("{} has no expression", process.id)))?;
    let inputs = serde_json::to_string(&localized(params))?;
    Ok(vec![
        "node".to_string(),
        "-e".to_string(),
        expression_script(expression, &inputs),
    ])
}

fn expression_script(expression: &str, inputs_json: &str) -> String {
    let trimmed = expression.trim();
    let body = if let Some(inner) = trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
    {
        format!("(function() {{ {inner} }})()")
    } else if let Some(inner) = trimmed.strip_prefix("$(").and_then(|s| s.strip_suffix(')')) {
        format!("({inner})")
    } else {
        format!("({trimmed})")
    };
    format!(
        "var inputs = {inputs_json}; var runtime = {{}}; var out = {body}; console.log(JSON.stringify(out));"
    )
}

/// Replace `$(inputs.name)` references in literal arguments.
fn substitute_inputs(text: &str, process: &Process, params: &Parameters) -> String {
    let mut out = text.to_string();
    for param in &process.inputs {
        let reference = format!("$(inputs.{})", local_name(&param.id));
        if out.contains(&reference) {
            let value = params.get(&param.id).or(param.default.as_ref());
            let rendered = value.map(|v| render_value(v).join(" ")).unwrap_or_default();
            out = out.replace(&reference, &rendered);
        }
    }
    out
}

/// Render a bound value as command-line tokens.
fn render_value(value: &Value) -> Vec<String> {
    match value {
        Value::Null => vec![],
        Value::Bool(b) => vec![b.to_string()],
        Value::Number(n) => vec![n.to_string()],
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(render_value).collect(),
        Value::Object(m) => {
            // File and Directory values render as their path
            m.get("path")
                .or_else(|| m.get("location"))
                .and_then(Value::as_str)
                .map(|p| vec![p.to_string()])
                .unwrap_or_else(|| vec![value.to_string()])
        }
    }
}

/// Re-key fully-qualified parameters by their local names, the form
/// expressions and stdout capture use.
pub fn localized(params: &Parameters) -> serde_json::Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (local_name(k).to_string(), v.clone()))
        .collect()
}

/// Derive a unique DNS-label job name from the run and task identity.
pub fn job_name(kind: &str, run_id: &str, task_id: &str) -> String {
    let run_part: String = run_id.chars().filter(char::is_ascii_alphanumeric).take(8).collect();
    let slug = sanitize_label(local_name(task_id));

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    run_id.hash(&mut hasher);
    task_id.hash(&mut hasher);
    let digest = format!("{:06x}", hasher.finish() & 0xff_ffff);

    let mut name = format!("{kind}-{run_part}-{slug}");
    name.truncate(63 - 7);
    let name = name.trim_end_matches('-').to_lowercase();
    format!("{name}-{digest}")
}

/// Coerce a string into label-value syntax (alphanumerics, `-`, `_`, `.`).
pub fn sanitize_label(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches(|c| c == '-' || c == '.' || c == '_').chars().take(63).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(value: serde_json::Value) -> Process {
        serde_json::from_value(value).unwrap()
    }

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_tool_command_with_bindings() {
        let process = tool(json!({
            "id": "#grep.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["grep"],
            "inputs": [
                {
                    "id": "#grep.cwl/pattern",
                    "type": "string",
                    "inputBinding": {"position": 1}
                },
                {
                    "id": "#grep.cwl/file",
                    "type": "File",
                    "inputBinding": {"position": 2}
                },
                {
                    "id": "#grep.cwl/count",
                    "type": ["boolean", "null"],
                    "inputBinding": {"prefix": "-c"}
                }
            ],
            "outputs": []
        }));

        let command = build_command(
            &process,
            &params(&[
                ("#grep.cwl/pattern", json!("needle")),
                ("#grep.cwl/file", json!({"class": "File", "location": "/data/hay.txt"})),
                ("#grep.cwl/count", json!(true)),
            ]),
        )
        .unwrap();

        assert_eq!(command, vec!["grep", "-c", "needle", "/data/hay.txt"]);
    }

    #[test]
    fn test_missing_required_input_fails() {
        let process = tool(json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["cat"],
            "inputs": [
                {"id": "#t.cwl/f", "type": "File", "inputBinding": {"position": 1}}
            ],
            "outputs": []
        }));
        let err = build_command(&process, &Parameters::new()).unwrap_err();
        assert_eq!(err.code(), "DISPATCH_ERROR");
    }

    #[test]
    fn test_optional_input_skipped() {
        let process = tool(json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["ls"],
            "inputs": [
                {"id": "#t.cwl/dir", "type": ["string", "null"], "inputBinding": {"position": 1}}
            ],
            "outputs": []
        }));
        let command = build_command(&process, &Parameters::new()).unwrap();
        assert_eq!(command, vec!["ls"]);
    }

    #[test]
    fn test_argument_substitution() {
        let process = tool(json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["sh", "-c"],
            "arguments": ["echo $(inputs.n)"],
            "inputs": [{"id": "#t.cwl/n", "type": "int"}],
            "outputs": []
        }));
        let command =
            build_command(&process, &params(&[("#t.cwl/n", json!(7))])).unwrap();
        assert_eq!(command, vec!["sh", "-c", "echo 7"]);
    }

    #[test]
    fn test_expression_command_binds_local_inputs() {
        let process = tool(json!({
            "id": "#e.cwl",
            "class": "ExpressionTool",
            "expression": "$({doubled: inputs.n * 2})",
            "inputs": [{"id": "#e.cwl/n", "type": "int"}],
            "outputs": [{"id": "#e.cwl/doubled", "type": "int"}]
        }));
        let command = build_command(&process, &params(&[("#e.cwl/n", json!(4))])).unwrap();
        assert_eq!(command[0], "node");
        assert!(command[2].contains("var inputs = {\"n\":4}"));
        assert!(command[2].contains("JSON.stringify"));
    }

    #[test]
    fn test_expression_block_body() {
        let script = expression_script("${ return {a: 1}; }", "{}");
        assert!(script.contains("(function() {  return {a: 1};  })()"));
    }

    #[test]
    fn test_job_name_is_dns_label() {
        let name = job_name("task", "0d9a8b7c-1234", "#main/do_thing/5");
        assert!(name.len() <= 63);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!name.starts_with('-') && !name.ends_with('-'));
    }

    #[test]
    fn test_job_names_differ_per_task() {
        let a = job_name("task", "run1", "#main/a");
        let b = job_name("task", "run1", "#main/b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_task_spec_labels_and_image() {
        let config = Config::default();
        let process = tool(json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [],
            "hints": [{"class": "DockerRequirement", "dockerPull": "python:3.12"}],
            "requirements": [{"class": "ResourceRequirement", "coresMin": 2, "ramMin": 2048}]
        }));

        let spec = task_job_spec(
            &config,
            "run-1",
            "#main/step",
            &process,
            &Parameters::new(),
            PathBuf::from("/data/u/r/working/step"),
            PathBuf::from("/data"),
        )
        .unwrap();

        assert_eq!(spec.image, "python:3.12");
        assert_eq!(spec.labels[APP_LABEL], TASK_APP);
        assert_eq!(spec.labels[RUN_ID_LABEL], "run-1");
        assert_eq!(spec.cores_min, Some(2.0));
        assert_eq!(spec.ram_min_mb, Some(2048));
        assert_eq!(spec.container_name, TASK_CONTAINER);
    }
}
