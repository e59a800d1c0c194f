//! Structural validation of packed documents.
//!
//! Answers "should the engine even attempt this workflow?" before a run is
//! dispatched. These are minimal shape and reference checks, not a CWL
//! validator: inputs are assumed to have been validated upstream.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::types::{PackedWorkflow, Process, ProcessClass};
use crate::pack::ENTRYPOINT;

/// Findings collected while checking a packed document. Empty means the
/// document is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Document-level findings.
    pub main: Vec<String>,

    /// Findings keyed by process id.
    #[serde(rename = "byProcess")]
    pub by_process: BTreeMap<String, Vec<String>>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.main.is_empty() && self.by_process.values().all(Vec::is_empty)
    }

    fn log(&mut self, finding: String) {
        self.main.push(finding);
    }

    fn log_for(&mut self, process: &str, finding: String) {
        self.by_process
            .entry(process.to_string())
            .or_default()
            .push(finding);
    }
}

/// Validate a packed document, reporting every finding rather than stopping
/// at the first.
pub fn validate(doc: &PackedWorkflow) -> ValidationReport {
    let mut report = ValidationReport::default();

    if doc.graph.is_empty() {
        report.log("missing $graph".to_string());
    }
    if doc.cwl_version.is_empty() {
        report.log("missing cwlVersion".to_string());
    }
    if doc.process(ENTRYPOINT).is_none() {
        report.log(format!("missing '{}' workflow", ENTRYPOINT));
    }

    let mut seen = BTreeSet::new();
    for process in &doc.graph {
        if !seen.insert(process.id.as_str()) {
            report.log(format!("duplicate process id {}", process.id));
        }
    }

    for process in &doc.graph {
        validate_process(doc, process, &mut report);
    }

    report
}

fn validate_process(doc: &PackedWorkflow, process: &Process, report: &mut ValidationReport) {
    match process.class {
        ProcessClass::Workflow => {
            if process.steps.is_empty() {
                report.log_for(&process.id, "workflow has no steps".to_string());
            }
            validate_steps(doc, process, report);
            validate_workflow_outputs(process, report);
            validate_step_cycles(process, report);
        }
        ProcessClass::CommandLineTool => {
            if process.base_command.is_empty() && process.arguments.is_empty() {
                report.log_for(&process.id, "tool has no command".to_string());
            }
        }
        ProcessClass::ExpressionTool => {
            if process.expression.is_none() {
                report.log_for(&process.id, "missing required field: 'expression'".to_string());
            }
        }
    }
}

fn validate_steps(doc: &PackedWorkflow, workflow: &Process, report: &mut ValidationReport) {
    // everything a step input may legally reference
    let step_output_ids: BTreeSet<&str> = workflow
        .steps
        .iter()
        .flat_map(|s| s.outputs.iter().map(String::as_str))
        .collect();
    let input_ids: BTreeSet<&str> = workflow.inputs.iter().map(|p| p.id.as_str()).collect();

    for step in &workflow.steps {
        if step.run.is_empty() {
            report.log_for(&workflow.id, format!("step '{}' missing field: run", step.id));
            continue;
        }
        if doc.process(&step.run).is_none() {
            report.log_for(
                &workflow.id,
                format!(
                    "step '{}' references unknown process: {}",
                    step.id, step.run
                ),
            );
        }
        for input in &step.inputs {
            if input.source.len() > 1 {
                report.log_for(
                    &workflow.id,
                    format!("input '{}' has multiple sources (linkMerge is not supported)", input.id),
                );
            }
            for source in &input.source {
                if !step_output_ids.contains(source.as_str())
                    && !input_ids.contains(source.as_str())
                {
                    report.log_for(
                        &workflow.id,
                        format!("input '{}' has unknown source: {}", input.id, source),
                    );
                }
            }
        }
        if !step.scatter.is_empty() && step.scatter.len() > 1 && step.scatter_method.is_none() {
            report.log_for(
                &workflow.id,
                format!(
                    "step '{}' scatters {} inputs but declares no scatterMethod",
                    step.id,
                    step.scatter.len()
                ),
            );
        }
    }
}

/// A cycle among step data edges would park the scheduler's activities
/// against each other forever, so it is rejected up front.
fn validate_step_cycles(workflow: &Process, report: &mut ValidationReport) {
    let producer_of: BTreeMap<&str, &str> = workflow
        .steps
        .iter()
        .flat_map(|s| s.outputs.iter().map(move |o| (o.as_str(), s.id.as_str())))
        .collect();
    let depends_on: BTreeMap<&str, Vec<&str>> = workflow
        .steps
        .iter()
        .map(|s| {
            let deps = s
                .inputs
                .iter()
                .flat_map(|i| i.source.iter())
                .filter_map(|src| producer_of.get(src.as_str()).copied())
                .collect();
            (s.id.as_str(), deps)
        })
        .collect();

    let mut settled = BTreeSet::new();
    for step in &workflow.steps {
        let mut in_progress = BTreeSet::new();
        if has_cycle(step.id.as_str(), &depends_on, &mut settled, &mut in_progress) {
            report.log_for(
                &workflow.id,
                format!("step dependency cycle involving '{}'", step.id),
            );
            return;
        }
    }
}

fn has_cycle<'a>(
    step: &'a str,
    depends_on: &BTreeMap<&'a str, Vec<&'a str>>,
    settled: &mut BTreeSet<&'a str>,
    in_progress: &mut BTreeSet<&'a str>,
) -> bool {
    if settled.contains(step) {
        return false;
    }
    if !in_progress.insert(step) {
        return true;
    }
    for dep in depends_on.get(step).into_iter().flatten() {
        if has_cycle(dep, depends_on, settled, in_progress) {
            return true;
        }
    }
    in_progress.remove(step);
    settled.insert(step);
    false
}

fn validate_workflow_outputs(workflow: &Process, report: &mut ValidationReport) {
    let step_output_ids: BTreeSet<&str> = workflow
        .steps
        .iter()
        .flat_map(|s| s.outputs.iter().map(String::as_str))
        .collect();
    let input_ids: BTreeSet<&str> = workflow.inputs.iter().map(|p| p.id.as_str()).collect();

    for output in &workflow.outputs {
        if output.output_source.is_empty() {
            report.log_for(
                &workflow.id,
                format!("output '{}' has no outputSource", output.id),
            );
        }
        if output.output_source.len() > 1 {
            report.log_for(
                &workflow.id,
                format!("output '{}' has multiple outputSources", output.id),
            );
        }
        for source in &output.output_source {
            if !step_output_ids.contains(source.as_str()) && !input_ids.contains(source.as_str()) {
                report.log_for(
                    &workflow.id,
                    format!("output '{}' has unknown outputSource: {}", output.id, source),
                );
            }
        }
    }
}
