//! Workflow packer.
//!
//! Converts a multi-file CWL graph (one entry file plus transitively
//! referenced files) into a single packed document: a `$graph` array of
//! process objects with fully-qualified identifiers and one declared
//! `cwlVersion`.
//!
//! The packer is the sole producer of identifiers of the form
//! `#file.cwl/localName`; everything downstream treats them as opaque and
//! joins edges with prefix relations only. Paths are resolved purely against
//! the referencing file, so packing is safe to run concurrently per request.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::PackError;

type PackResult<T> = std::result::Result<T, PackError>;

/// Fields the CWL spec permits as either a map keyed by local name or an
/// array of objects. The packer always emits the array form.
const LIST_OR_MAP_FIELDS: &[&str] = &["inputs", "outputs", "in", "steps", "requirements", "hints"];

/// Identifier assigned to the entry process of a packed graph.
pub const ENTRYPOINT: &str = "#main";

/// Pack the CWL file at `entry` and everything it references into a single
/// packed document.
pub fn pack_file(entry: &Path) -> PackResult<Value> {
    let mut packer = Packer::default();
    let abs = absolutize(entry, None)?;
    packer.pack(&abs, ENTRYPOINT.to_string())?;
    packer.finish()
}

/// Expand CWL type shorthand.
///
/// `X[]` becomes `{type: array, items: X}` and `X?` becomes `[X, "null"]`;
/// anything else is returned unchanged. Only plain named types are
/// supported; user-defined schemas and `$import` are not.
pub fn resolve_type(s: &str) -> Value {
    if let Some(items) = s.strip_suffix("[]") {
        return json!({ "type": "array", "items": items });
    }
    if let Some(name) = s.strip_suffix('?') {
        return json!([name, "null"]);
    }
    Value::String(s.to_string())
}

/// [`resolve_type`] lifted to JSON values: strings are expanded, every other
/// shape passes through. Applying it twice is a no-op.
pub fn resolve_type_value(v: &Value) -> Value {
    match v {
        Value::String(s) => resolve_type(s),
        other => other.clone(),
    }
}

/// Qualify a `source`/`outputSource` reference: references join at the root
/// of the enclosing scope, so `step/out` under `#main/step2` becomes
/// `#main/step/out`.
pub(crate) fn qualify_source(parent_id: &str, s: &str) -> String {
    if s.starts_with('#') {
        return s.to_string();
    }
    format!("{}/{}", scope_root(parent_id), s)
}

/// Qualify an `out`/`scatter` (or map-key-derived) identifier against its
/// immediately enclosing scope.
pub(crate) fn qualify_id(parent_id: &str, s: &str) -> String {
    if s.starts_with('#') {
        return s.to_string();
    }
    format!("{}/{}", parent_id, s)
}

fn scope_root(id: &str) -> &str {
    id.split('/').next().unwrap_or(id)
}

/// Resolve `path` against the directory of the referencing file without
/// touching the process working directory.
fn absolutize(path: &Path, parent: Option<&Path>) -> PackResult<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match parent {
            Some(parent) => parent
                .parent()
                .map(|dir| dir.join(path))
                .unwrap_or_else(|| path.to_path_buf()),
            None => std::env::current_dir()
                .map_err(|e| PackError::UnresolvableImport {
                    path: path.to_path_buf(),
                    parent: PathBuf::new(),
                    reason: e.to_string(),
                })?
                .join(path),
        }
    };
    joined
        .canonicalize()
        .map_err(|e| PackError::UnresolvableImport {
            path: path.to_path_buf(),
            parent: parent.map(Path::to_path_buf).unwrap_or_default(),
            reason: e.to_string(),
        })
}

#[derive(Default)]
struct Packer {
    graph: Vec<Value>,
    versions: BTreeMap<String, Vec<PathBuf>>,
    /// Files currently being packed, for cycle detection.
    stack: Vec<PathBuf>,
    /// Files already appended to the graph, with the id they were given.
    packed: BTreeSet<PathBuf>,
}

impl Packer {
    /// Pack one file under the given process id, appending it (and anything
    /// it references) to the graph.
    fn pack(&mut self, path: &Path, id: String) -> PackResult<()> {
        if self.stack.iter().any(|p| p == path) {
            return Err(PackError::ImportCycle(path.to_path_buf()));
        }
        if self.packed.contains(path) {
            return Ok(());
        }
        debug!(file = %path.display(), id = %id, "packing");

        let raw = std::fs::read_to_string(path).map_err(|e| PackError::UnresolvableImport {
            path: path.to_path_buf(),
            parent: self.stack.last().cloned().unwrap_or_default(),
            reason: e.to_string(),
        })?;
        // CWL permits both YAML and JSON; YAML 1.2 subsumes JSON.
        let value: Value =
            serde_yaml::from_str(&raw).map_err(|e| PackError::UnresolvableImport {
                path: path.to_path_buf(),
                parent: self.stack.last().cloned().unwrap_or_default(),
                reason: e.to_string(),
            })?;

        self.stack.push(path.to_path_buf());
        let result = self.pack_value(value, &id, path);
        self.stack.pop();
        self.packed.insert(path.to_path_buf());
        result
    }

    /// Pack an in-memory document. An already-packed document (one carrying
    /// `$graph`) contributes its processes verbatim, which makes packing
    /// idempotent.
    fn pack_value(&mut self, value: Value, id: &str, path: &Path) -> PackResult<()> {
        if let Value::Object(ref map) = value {
            if let Some(Value::Array(graph)) = map.get("$graph") {
                if let Some(Value::String(version)) = map.get("cwlVersion") {
                    self.record_version(version, path);
                }
                self.graph.extend(graph.iter().cloned());
                return Ok(());
            }
        }

        let converted = match value {
            Value::Object(map) => self.convert_object(map, Some(id), id, path)?,
            other => {
                return Err(PackError::InvalidShape {
                    field: "document root".to_string(),
                    detail: format!("expected a mapping, got {}", kind_of(&other)),
                })
            }
        };
        self.graph.push(converted);
        Ok(())
    }

    fn record_version(&mut self, version: &str, path: &Path) {
        self.versions
            .entry(version.to_string())
            .or_default()
            .push(path.to_path_buf());
    }

    /// Assemble the packed document, failing if the referenced files did not
    /// agree on a single language version.
    fn finish(self) -> PackResult<Value> {
        let mut versions = self.versions;
        match versions.len() {
            0 => Err(PackError::MissingVersion),
            1 => {
                let version = versions.keys().next().cloned().unwrap_or_default();
                Ok(json!({ "$graph": self.graph, "cwlVersion": version }))
            }
            _ => {
                for paths in versions.values_mut() {
                    paths.sort();
                    paths.dedup();
                }
                Err(PackError::VersionConflict(versions))
            }
        }
    }

    /// Convert one node of the document tree.
    ///
    /// `parent_key` is the field this value sits under, `parent_id` the
    /// fully-qualified id of the enclosing scope. `in_array` suppresses
    /// map-to-array normalization for values that are already array
    /// elements.
    fn convert(
        &mut self,
        value: Value,
        parent_key: &str,
        parent_id: &str,
        in_array: bool,
        path: &Path,
    ) -> PackResult<Value> {
        match value {
            Value::Object(map) => {
                if LIST_OR_MAP_FIELDS.contains(&parent_key) && !in_array {
                    return self.normalize_map(map, parent_key, parent_id, path);
                }
                self.convert_object(map, None, parent_id, path)
            }
            Value::Array(items) => {
                let mut converted = Vec::with_capacity(items.len());
                for item in items {
                    converted.push(self.convert(item, parent_key, parent_id, true, path)?);
                }
                Ok(Value::Array(converted))
            }
            Value::String(s) => self.convert_string(s, parent_key, parent_id, path),
            other => Ok(other),
        }
    }

    /// Convert a generic mapping. When the mapping declares an `id` its
    /// qualified form becomes the scope for every sibling field, so step
    /// inputs end up as `#file.cwl/step/localName` whether the document was
    /// written in map or array form.
    ///
    /// `forced_id` is set for the primary routine of each file: the whole
    /// document gets the file's process id.
    fn convert_object(
        &mut self,
        map: Map<String, Value>,
        forced_id: Option<&str>,
        parent_id: &str,
        path: &Path,
    ) -> PackResult<Value> {
        let scope = match forced_id {
            Some(id) => id.to_string(),
            None => match map.get("id") {
                Some(Value::String(id)) => qualify_id(parent_id, id),
                _ => parent_id.to_string(),
            },
        };

        let mut out = Map::new();
        if forced_id.is_some() || map.contains_key("id") {
            out.insert("id".to_string(), json!(scope.clone()));
        }
        for (key, value) in map {
            match key.as_str() {
                "id" => {}
                // version declarations are hoisted to the document root
                "cwlVersion" => {
                    if let Value::String(version) = &value {
                        self.record_version(version, path);
                    }
                }
                _ => {
                    let converted = self.convert(value, &key, &scope, false, path)?;
                    out.insert(key, converted);
                }
            }
        }
        Ok(Value::Object(out))
    }

    /// Normalize a list-or-map field written in map form to the array form,
    /// expanding string shorthand where the CWL spec permits it.
    fn normalize_map(
        &mut self,
        entries: Map<String, Value>,
        field: &str,
        parent_id: &str,
        path: &Path,
    ) -> PackResult<Value> {
        let mut arr = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let id = qualify_id(parent_id, &key);
            let converted = self.convert(value, &key, &id, false, path)?;
            let mut obj = match converted {
                Value::Object(m) => m,
                Value::String(s) => {
                    let mut m = Map::new();
                    match field {
                        "inputs" | "outputs" => {
                            m.insert("type".to_string(), resolve_type(&s));
                        }
                        "in" => {
                            m.insert("source".to_string(), json!(qualify_source(parent_id, &s)));
                        }
                        _ => return Err(PackError::ShorthandNotAllowedHere(field.to_string())),
                    }
                    m
                }
                other => {
                    return Err(PackError::InvalidShape {
                        field: field.to_string(),
                        detail: format!("entry '{}' is {}", key, kind_of(&other)),
                    })
                }
            };
            match field {
                "requirements" | "hints" => {
                    obj.insert("class".to_string(), json!(key));
                }
                _ => {
                    obj.insert("id".to_string(), json!(id));
                }
            }
            arr.push(Value::Object(obj));
        }
        Ok(Value::Array(arr))
    }

    /// Rewrite string values whose field gives them reference semantics.
    fn convert_string(
        &mut self,
        s: String,
        parent_key: &str,
        parent_id: &str,
        path: &Path,
    ) -> PackResult<Value> {
        match parent_key {
            "cwlVersion" => {
                self.record_version(&s, path);
                Ok(Value::String(s))
            }
            "type" => Ok(resolve_type(&s)),
            "source" | "outputSource" => Ok(json!(qualify_source(parent_id, &s))),
            "out" | "scatter" => Ok(json!(qualify_id(parent_id, &s))),
            "run" => {
                if s.starts_with('#') {
                    return Ok(Value::String(s));
                }
                let referenced = Path::new(&s);
                let basename = referenced
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| PackError::UnresolvableImport {
                        path: referenced.to_path_buf(),
                        parent: path.to_path_buf(),
                        reason: "reference has no file name".to_string(),
                    })?;
                let id = format!("#{}", basename);
                let abs = absolutize(referenced, Some(path))?;
                self.pack(&abs, id.clone())?;
                Ok(Value::String(id))
            }
            _ => Ok(Value::String(s)),
        }
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}
