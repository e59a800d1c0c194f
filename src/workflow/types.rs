//! Typed model of a packed workflow document.
//!
//! These types deserialize the packed form only: list-or-map fields are
//! always arrays and every identifier is fully qualified, because the packer
//! normalized them. Nothing here re-handles the map form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Bound parameter values, keyed by fully-qualified parameter id.
pub type Parameters = BTreeMap<String, Value>;

/// A packed workflow document: every process in one `$graph`, one declared
/// language version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedWorkflow {
    #[serde(rename = "$graph")]
    pub graph: Vec<Process>,

    #[serde(rename = "cwlVersion")]
    pub cwl_version: String,
}

impl PackedWorkflow {
    /// Look up a process by fully-qualified id.
    pub fn process(&self, id: &str) -> Option<&Process> {
        self.graph.iter().find(|p| p.id == id)
    }

    /// Look up a process, failing with `UnknownProcess`.
    pub fn require_process(&self, id: &str) -> Result<&Process> {
        self.process(id)
            .ok_or_else(|| Error::UnknownProcess(id.to_string()))
    }
}

/// Process classes the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessClass {
    Workflow,
    CommandLineTool,
    ExpressionTool,
}

impl std::fmt::Display for ProcessClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "Workflow"),
            Self::CommandLineTool => write!(f, "CommandLineTool"),
            Self::ExpressionTool => write!(f, "ExpressionTool"),
        }
    }
}

/// One process object of the `$graph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: String,

    pub class: ProcessClass,

    #[serde(default)]
    pub inputs: Vec<Parameter>,

    #[serde(default)]
    pub outputs: Vec<Parameter>,

    /// Workflow only
    #[serde(default)]
    pub steps: Vec<Step>,

    /// CommandLineTool only
    #[serde(default, deserialize_with = "de::string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub base_command: Vec<String>,

    /// CommandLineTool only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,

    /// ExpressionTool only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Requirement>,
}

impl Process {
    /// Find a requirement or hint by class; requirements win over hints.
    pub fn requirement(&self, class: &str) -> Option<&Requirement> {
        self.requirements
            .iter()
            .chain(self.hints.iter())
            .find(|r| r.class == class)
    }

    /// Container image from a `DockerRequirement`, if declared.
    pub fn docker_image(&self) -> Option<&str> {
        self.requirement("DockerRequirement")
            .and_then(|r| r.fields.get("dockerPull"))
            .and_then(Value::as_str)
    }

    /// Resource floor from a `ResourceRequirement`: (coresMin, ramMin in MB).
    pub fn resource_floor(&self) -> (Option<f64>, Option<i64>) {
        match self.requirement("ResourceRequirement") {
            Some(r) => (
                r.fields.get("coresMin").and_then(Value::as_f64),
                r.fields.get("ramMin").and_then(Value::as_i64),
            ),
            None => (None, None),
        }
    }

    /// Find a declared input parameter by fully-qualified id.
    pub fn input(&self, id: &str) -> Option<&Parameter> {
        self.inputs.iter().find(|p| p.id == id)
    }

    /// Find a step by fully-qualified id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// An input or output parameter descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub cwl_type: Option<CwlType>,

    /// Output parameters of a Workflow: where the value comes from.
    #[serde(default, deserialize_with = "de::string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub output_source: Vec<String>,

    /// Output parameters of a CommandLineTool: how to capture the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_binding: Option<OutputBinding>,

    /// Input parameters of a CommandLineTool: how to place the value on the
    /// command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_binding: Option<CommandLineBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Parameter {
    /// Whether a missing value is acceptable for this parameter.
    pub fn is_optional(&self) -> bool {
        self.default.is_some()
            || self
                .cwl_type
                .as_ref()
                .map(CwlType::accepts_null)
                .unwrap_or(false)
    }
}

/// Output capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

/// Command-line placement of an input value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLineBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// A CommandLineTool argument: a bare string or a binding object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Literal(String),
    Binding(CommandLineBinding),
}

/// A parameter type: a scalar name, an array form, or a union (the packed
/// rendering of `T?` is `[T, "null"]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CwlType {
    Name(String),
    Array {
        #[serde(rename = "type")]
        kind: String,
        items: Box<CwlType>,
    },
    Union(Vec<CwlType>),
}

impl CwlType {
    pub fn is_array(&self) -> bool {
        matches!(self, CwlType::Array { .. })
    }

    pub fn accepts_null(&self) -> bool {
        match self {
            CwlType::Name(name) => name == "null" || name == "Any",
            CwlType::Array { .. } => false,
            CwlType::Union(alts) => alts.iter().any(CwlType::accepts_null),
        }
    }

    /// Structural check of a captured value against this type. Deliberately
    /// permissive: it answers "could this value possibly be a T", not full
    /// CWL schema validation.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            CwlType::Name(name) => match name.as_str() {
                "Any" => true,
                "null" => value.is_null(),
                "boolean" => value.is_boolean(),
                "int" | "long" => value.is_i64() || value.is_u64(),
                "float" | "double" => value.is_number(),
                "string" | "stdout" => value.is_string(),
                "File" | "Directory" => match value {
                    Value::String(_) => true,
                    Value::Object(m) => {
                        m.get("class").and_then(Value::as_str) == Some(name.as_str())
                            || m.contains_key("location")
                            || m.contains_key("path")
                    }
                    _ => false,
                },
                _ => true,
            },
            CwlType::Array { items, .. } => match value {
                Value::Array(values) => values.iter().all(|v| items.accepts(v)),
                _ => false,
            },
            CwlType::Union(alts) => alts.iter().any(|t| t.accepts(value)),
        }
    }
}

/// A workflow step: the invocation of another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,

    #[serde(rename = "in", default)]
    pub inputs: Vec<StepInput>,

    #[serde(rename = "out", default, deserialize_with = "de::id_seq")]
    pub outputs: Vec<String>,

    /// Fully-qualified reference to a process in the `$graph`.
    pub run: String,

    #[serde(default, deserialize_with = "de::string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub scatter: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scatter_method: Option<ScatterMethod>,
}

/// A step input binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    #[serde(default)]
    pub id: String,

    #[serde(default, deserialize_with = "de::string_or_seq", skip_serializing_if = "Vec::is_empty")]
    pub source: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// How scatter shards are formed from multiple scattered inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterMethod {
    Dotproduct,
    NestedCrossproduct,
    FlatCrossproduct,
}

/// A requirement or hint: a class name plus class-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub class: String,

    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// The local (unqualified) tail of a fully-qualified identifier.
pub fn local_name(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

mod de {
    //! List-or-scalar deserializers: the packed form may carry a lone string
    //! where a sequence is meant, and step `out` entries may be strings or
    //! `{id}` objects.

    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        })
    }

    pub fn id_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values: Vec<Value> = Vec::deserialize(deserializer)?;
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            match value {
                Value::String(s) => out.push(s),
                Value::Object(m) => {
                    if let Some(id) = m.get("id").and_then(Value::as_str) {
                        out.push(id.to_string());
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> PackedWorkflow {
        serde_json::from_value(json!({
            "cwlVersion": "v1.0",
            "$graph": [
                {
                    "id": "#main",
                    "class": "Workflow",
                    "inputs": [{"id": "#main/x", "type": "int"}],
                    "outputs": [{
                        "id": "#main/result",
                        "type": "int",
                        "outputSource": "#main/square/out"
                    }],
                    "steps": [{
                        "id": "#main/square",
                        "run": "#square.cwl",
                        "in": [{"id": "#main/square/n", "source": "#main/x"}],
                        "out": ["#main/square/out"]
                    }]
                },
                {
                    "id": "#square.cwl",
                    "class": "CommandLineTool",
                    "baseCommand": ["sh", "-c"],
                    "inputs": [{"id": "#square.cwl/n", "type": "int"}],
                    "outputs": [{"id": "#square.cwl/out", "type": "int"}],
                    "requirements": [
                        {"class": "ResourceRequirement", "coresMin": 2, "ramMin": 1024}
                    ],
                    "hints": [
                        {"class": "DockerRequirement", "dockerPull": "alpine:3.19"}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_deserialize_packed_document() {
        let doc = sample_doc();
        assert_eq!(doc.cwl_version, "v1.0");
        assert_eq!(doc.graph.len(), 2);

        let main = doc.require_process("#main").unwrap();
        assert_eq!(main.class, ProcessClass::Workflow);
        assert_eq!(main.steps[0].run, "#square.cwl");
        assert_eq!(main.steps[0].inputs[0].source, vec!["#main/x"]);
        assert_eq!(main.outputs[0].output_source, vec!["#main/square/out"]);
    }

    #[test]
    fn test_unknown_process() {
        let doc = sample_doc();
        let err = doc.require_process("#missing").unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_PROCESS");
    }

    #[test]
    fn test_requirement_lookup() {
        let doc = sample_doc();
        let tool = doc.require_process("#square.cwl").unwrap();
        assert_eq!(tool.docker_image(), Some("alpine:3.19"));
        assert_eq!(tool.resource_floor(), (Some(2.0), Some(1024)));
    }

    #[test]
    fn test_step_out_accepts_objects() {
        let step: Step = serde_json::from_value(json!({
            "id": "#main/s",
            "run": "#t.cwl",
            "in": [],
            "out": [{"id": "#main/s/a"}, "#main/s/b"]
        }))
        .unwrap();
        assert_eq!(step.outputs, vec!["#main/s/a", "#main/s/b"]);
    }

    #[test]
    fn test_cwl_type_shapes() {
        let scalar: CwlType = serde_json::from_value(json!("File")).unwrap();
        let array: CwlType =
            serde_json::from_value(json!({"type": "array", "items": "int"})).unwrap();
        let optional: CwlType = serde_json::from_value(json!(["string", "null"])).unwrap();

        assert!(!scalar.is_array());
        assert!(array.is_array());
        assert!(optional.accepts_null());

        assert!(array.accepts(&json!([1, 2, 3])));
        assert!(!array.accepts(&json!("nope")));
        assert!(optional.accepts(&json!(null)));
        assert!(optional.accepts(&json!("yes")));
        assert!(scalar.accepts(&json!({"class": "File", "location": "/data/a.txt"})));
        assert!(!scalar.accepts(&json!(42)));
    }

    #[test]
    fn test_scatter_method_names() {
        let m: ScatterMethod = serde_json::from_value(json!("nested_crossproduct")).unwrap();
        assert_eq!(m, ScatterMethod::NestedCrossproduct);
    }

    #[test]
    fn test_local_name() {
        assert_eq!(local_name("#main/square/out"), "out");
        assert_eq!(local_name("#main"), "#main");
    }
}
