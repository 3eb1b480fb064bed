use std::path::{Path, PathBuf};

use stepflow_types::{Result, StepflowError};

use crate::ast::WorkflowDefinition;

/// Where a workflow definition comes from.
#[derive(Debug, Clone)]
pub enum DefinitionSource {
    /// A `.json`, `.yaml` or `.yml` file.
    Path(PathBuf),
    /// Document text; JSON when it starts with `{`, YAML otherwise.
    Text(String),
    /// An in-memory JSON value.
    Value(serde_json::Value),
    /// An already deserialized document.
    Document(WorkflowDefinition),
}

impl DefinitionSource {
    pub fn load(self) -> Result<WorkflowDefinition> {
        match self {
            DefinitionSource::Path(path) => load(&path),
            DefinitionSource::Text(text) => parse(&text),
            DefinitionSource::Value(value) => {
                serde_json::from_value(value).map_err(|e| parse_error("JSON", e))
            }
            DefinitionSource::Document(doc) => Ok(doc),
        }
    }
}

impl From<WorkflowDefinition> for DefinitionSource {
    fn from(doc: WorkflowDefinition) -> Self {
        DefinitionSource::Document(doc)
    }
}

impl From<serde_json::Value> for DefinitionSource {
    fn from(value: serde_json::Value) -> Self {
        DefinitionSource::Value(value)
    }
}

impl From<&Path> for DefinitionSource {
    fn from(path: &Path) -> Self {
        DefinitionSource::Path(path.to_path_buf())
    }
}

fn parse_error(format: &str, err: impl std::fmt::Display) -> StepflowError {
    StepflowError::Parse {
        format: format.to_string(),
        message: err.to_string(),
    }
}

pub fn parse_json(input: &str) -> Result<WorkflowDefinition> {
    serde_json::from_str(input).map_err(|e| parse_error("JSON", e))
}

pub fn parse_yaml(input: &str) -> Result<WorkflowDefinition> {
    serde_yaml::from_str(input).map_err(|e| parse_error("YAML", e))
}

/// Parse definition text, choosing JSON or YAML from its first character.
pub fn parse(input: &str) -> Result<WorkflowDefinition> {
    if input.trim_start().starts_with('{') {
        parse_json(input)
    } else {
        parse_yaml(input)
    }
}

/// Read and parse a definition file. The extension picks the format;
/// unknown extensions fall back to [`parse`].
pub fn load(path: &Path) -> Result<WorkflowDefinition> {
    let source = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    tracing::debug!(path = %path.display(), "Loading workflow definition");
    match ext.as_deref() {
        Some("json") => parse_json(&source),
        Some("yaml") | Some("yml") => parse_yaml(&source),
        _ => parse(&source),
    }
}
