//! Error types for skiff.
//!
//! Every failure surfaced by the engine carries a machine-parseable code so
//! API consumers can branch on the kind of failure without string matching.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, Error>;

/// skiff error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("multiple sources for {0} are not supported")]
    MultipleSources(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("task exceeded wall-clock limit of {0}s")]
    Timeout(u64),

    #[error("run cancelled")]
    Cancelled,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for machine parsing.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Pack(_) => "PACK_ERROR",
            Error::UnknownProcess(_) => "UNKNOWN_PROCESS",
            Error::UnknownSource(_) => "UNKNOWN_SOURCE",
            Error::MultipleSources(_) => "MULTIPLE_SOURCES",
            Error::Dispatch(_) => "DISPATCH_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Auth(_) => "AUTH_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status the API layer should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Pack(_)
            | Error::UnknownProcess(_)
            | Error::UnknownSource(_)
            | Error::MultipleSources(_)
            | Error::Validation(_) => 400,
            Error::Auth(_) => 403,
            Error::NotFound(_) => 404,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Convert to a JSON error envelope for API responses.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Errors raised while packing a multi-file CWL graph into a single document.
///
/// Packing runs synchronously before a run exists, so none of these leave a
/// run record behind.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("cannot resolve import {path} (referenced from {parent}): {reason}")]
    UnresolvableImport {
        path: PathBuf,
        parent: PathBuf,
        reason: String,
    },

    #[error("import cycle through {0}")]
    ImportCycle(PathBuf),

    #[error("conflicting cwlVersion declarations:{}", format_version_map(.0))]
    VersionConflict(BTreeMap<String, Vec<PathBuf>>),

    #[error("no cwlVersion declared anywhere in the workflow")]
    MissingVersion,

    #[error("shorthand string not allowed under field '{0}'")]
    ShorthandNotAllowedHere(String),

    #[error("invalid shape for field '{field}': {detail}")]
    InvalidShape { field: String, detail: String },
}

/// Render the version map one line per version, files grouped underneath, so
/// a user can see exactly which files disagree.
fn format_version_map(versions: &BTreeMap<String, Vec<PathBuf>>) -> String {
    let mut out = String::new();
    for (version, paths) in versions {
        out.push_str(&format!("\n  {}:", version));
        for path in paths {
            out.push_str(&format!("\n    {}", path.display()));
        }
    }
    out
}
