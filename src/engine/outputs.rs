//! Leaf output capture.
//!
//! On success, a leaf task's declared outputs are read back from the task
//! working directory: stdout JSON by convention (always for ExpressionTool),
//! glob patterns per `outputBinding` for CommandLineTool file outputs, and a
//! raw-stdout fallback for plain string outputs. Every captured value is
//! checked against the declared type before it is published.

use std::path::Path;

use regex::Regex;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::jobs::STDOUT_FILE;
use crate::workflow::{local_name, CwlType, Parameter, Parameters, Process};

/// Capture and type-check every declared output of `process` from its task
/// working directory.
pub(crate) fn capture_outputs(process: &Process, working_dir: &Path) -> Result<Parameters> {
    let stdout_raw = std::fs::read_to_string(working_dir.join(STDOUT_FILE)).ok();
    let stdout_json: Option<Value> = stdout_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    let mut outputs = Parameters::new();
    for param in &process.outputs {
        let value = capture_parameter(param, working_dir, &stdout_raw, &stdout_json)?;

        if let Some(declared) = &param.cwl_type {
            if !declared.accepts(&value) {
                return Err(Error::Execution(format!(
                    "output {} does not match its declared type: {}",
                    param.id, value
                )));
            }
        }
        outputs.insert(param.id.clone(), value);
    }
    Ok(outputs)
}

fn capture_parameter(
    param: &Parameter,
    working_dir: &Path,
    stdout_raw: &Option<String>,
    stdout_json: &Option<Value>,
) -> Result<Value> {
    if let Some(glob) = param.output_binding.as_ref().and_then(|b| b.glob.as_deref()) {
        return glob_capture(glob, working_dir, param);
    }

    let local = local_name(&param.id);
    if let Some(value) = stdout_json.as_ref().and_then(|j| j.get(local)) {
        return Ok(value.clone());
    }

    // raw stdout satisfies a plain string output ("hello\n" and the like)
    if let Some(raw) = stdout_raw {
        if matches!(&param.cwl_type, Some(CwlType::Name(n)) if n == "string" || n == "stdout") {
            return Ok(json!(raw));
        }
    }

    if param.is_optional() {
        return Ok(Value::Null);
    }
    Err(Error::Execution(format!(
        "output {} was not produced",
        param.id
    )))
}

fn glob_capture(pattern: &str, working_dir: &Path, param: &Parameter) -> Result<Value> {
    let regex = glob_to_regex(pattern)?;
    let mut matches: Vec<String> = Vec::new();
    let entries = match std::fs::read_dir(working_dir) {
        Ok(entries) => entries,
        Err(e) => {
            return Err(Error::Execution(format!(
                "cannot read working directory for output {}: {e}",
                param.id
            )))
        }
    };
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if regex.is_match(name) {
                matches.push(name.to_string());
            }
        }
    }
    matches.sort();

    let files: Vec<Value> = matches
        .iter()
        .map(|name| file_value(working_dir, name))
        .collect();

    if param.cwl_type.as_ref().map(CwlType::is_array).unwrap_or(false) {
        return Ok(Value::Array(files));
    }
    match files.into_iter().next() {
        Some(file) => Ok(file),
        None if param.is_optional() => Ok(Value::Null),
        None => Err(Error::Execution(format!(
            "no file matched glob '{pattern}' for output {}",
            param.id
        ))),
    }
}

fn file_value(working_dir: &Path, name: &str) -> Value {
    let path = working_dir.join(name);
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    json!({
        "class": "File",
        "location": path.display().to_string(),
        "basename": name,
        "size": size,
    })
}

/// Translate a file glob (`*`, `?`, everything else literal) to an anchored
/// regular expression over file names.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expression = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str("[^/]*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression)
        .map_err(|e| Error::Execution(format!("invalid glob pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn process(value: serde_json::Value) -> Process {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_stdout_json_capture() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), r#"{"n": 3, "name": "a"}"#).unwrap();

        let p = process(serde_json::json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [
                {"id": "#t.cwl/n", "type": "int"},
                {"id": "#t.cwl/name", "type": "string"}
            ]
        }));

        let outputs = capture_outputs(&p, dir.path()).unwrap();
        assert_eq!(outputs["#t.cwl/n"], serde_json::json!(3));
        assert_eq!(outputs["#t.cwl/name"], serde_json::json!("a"));
    }

    #[test]
    fn test_raw_stdout_fallback_for_string_output() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), "hello\n").unwrap();

        let p = process(serde_json::json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["echo"],
            "inputs": [],
            "outputs": [{"id": "#t.cwl/said", "type": "string"}]
        }));

        let outputs = capture_outputs(&p, dir.path()).unwrap();
        assert_eq!(outputs["#t.cwl/said"], serde_json::json!("hello\n"));
    }

    #[test]
    fn test_glob_capture_single_and_array() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "aa").unwrap();
        std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
        std::fs::write(dir.path().join("c.log"), "cc").unwrap();

        let p = process(serde_json::json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [
                {
                    "id": "#t.cwl/all",
                    "type": {"type": "array", "items": "File"},
                    "outputBinding": {"glob": "*.txt"}
                },
                {
                    "id": "#t.cwl/log",
                    "type": "File",
                    "outputBinding": {"glob": "*.log"}
                }
            ]
        }));

        let outputs = capture_outputs(&p, dir.path()).unwrap();
        let all = outputs["#t.cwl/all"].as_array().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["basename"], "a.txt");
        assert_eq!(all[1]["basename"], "b.txt");
        assert_eq!(all[1]["size"], 2);

        assert_eq!(outputs["#t.cwl/log"]["class"], "File");
        assert_eq!(outputs["#t.cwl/log"]["basename"], "c.log");
    }

    #[test]
    fn test_missing_required_output_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), "{}").unwrap();

        let p = process(serde_json::json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [{"id": "#t.cwl/n", "type": "int"}]
        }));

        let err = capture_outputs(&p, dir.path()).unwrap_err();
        assert!(err.to_string().contains("was not produced"));
    }

    #[test]
    fn test_missing_optional_output_is_null() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), "{}").unwrap();

        let p = process(serde_json::json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [{"id": "#t.cwl/n", "type": ["int", "null"]}]
        }));

        let outputs = capture_outputs(&p, dir.path()).unwrap();
        assert_eq!(outputs["#t.cwl/n"], serde_json::Value::Null);
    }

    #[test]
    fn test_type_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STDOUT_FILE), r#"{"n": "three"}"#).unwrap();

        let p = process(serde_json::json!({
            "id": "#t.cwl",
            "class": "CommandLineTool",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [{"id": "#t.cwl/n", "type": "int"}]
        }));

        let err = capture_outputs(&p, dir.path()).unwrap_err();
        assert!(err.to_string().contains("declared type"));
    }

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("*.txt").unwrap();
        assert!(re.is_match("a.txt"));
        assert!(!re.is_match("a.txt.bak"));
        assert!(!re.is_match("atxt"));

        let re = glob_to_regex("out?.dat").unwrap();
        assert!(re.is_match("out1.dat"));
        assert!(!re.is_match("out12.dat"));
    }
}
