//! Shared types, errors, value kinds, and checkpoints for the Stepflow workflow engine.
//!
//! This crate provides the foundational types used across all other Stepflow crates:
//! - `StepflowError`: unified error taxonomy
//! - `ValueKind`: declared value kinds with defaults and coercion rules
//! - `Record`: uniform keyed access over run state and JSON values
//! - `Phase`: lifecycle of an execution context
//! - `Checkpoint`: serializable run-state snapshot for durable sessions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

mod record;
mod value_kind;

pub use record::Record;
pub use value_kind::ValueKind;

/// Unified error type for all Stepflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StepflowError {
    // === Run-time wiring errors ===
    #[error("Reference '{path}' could not be resolved{}: {message}", on_step(.step))]
    Reference {
        path: String,
        step: Option<String>,
        message: String,
    },

    #[error("Cannot coerce{} to {kind}{}: {message}", on_field(.field), on_step(.step))]
    Coercion {
        kind: String,
        message: String,
        step: Option<String>,
        field: Option<String>,
    },

    #[error("Workload for step '{step}' failed: {message}")]
    Workload { step: String, message: String },

    #[error("Run exceeded the limit of {limit} step visits")]
    StepLimitExceeded { limit: usize },

    // === Definition errors ===
    #[error("Workflow configuration invalid: {0}")]
    Config(String),

    #[error("{format} parse error: {message}")]
    Parse { format: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn on_step(step: &Option<String>) -> String {
    match step {
        Some(s) => format!(" in step '{s}'"),
        None => String::new(),
    }
}

fn on_field(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" field '{f}'"),
        None => String::new(),
    }
}

impl StepflowError {
    /// Build a reference error that is not yet attributed to a step.
    pub fn reference(path: impl Into<String>, message: impl Into<String>) -> Self {
        StepflowError::Reference {
            path: path.into(),
            step: None,
            message: message.into(),
        }
    }

    /// Build a coercion error that is not yet attributed to a step or field.
    pub fn coercion(kind: impl fmt::Display, message: impl Into<String>) -> Self {
        StepflowError::Coercion {
            kind: kind.to_string(),
            message: message.into(),
            step: None,
            field: None,
        }
    }

    /// Attach a step id to reference and coercion errors that lack one.
    pub fn with_step(mut self, step_id: &str) -> Self {
        match &mut self {
            StepflowError::Reference { step, .. } | StepflowError::Coercion { step, .. }
                if step.is_none() =>
            {
                *step = Some(step_id.to_string());
            }
            _ => {}
        }
        self
    }

    /// Attach a field name to a coercion error that lacks one.
    pub fn with_field(mut self, field_name: &str) -> Self {
        if let StepflowError::Coercion { field, .. } = &mut self {
            if field.is_none() {
                *field = Some(field_name.to_string());
            }
        }
        self
    }

    /// Returns `true` for errors raised while reading or planning a
    /// definition, before any step has run.
    pub fn is_config_time(&self) -> bool {
        matches!(
            self,
            StepflowError::Config(_) | StepflowError::Parse { .. }
        )
    }

    /// Returns `true` for errors that abort an in-flight run.
    pub fn is_run_failure(&self) -> bool {
        matches!(
            self,
            StepflowError::Reference { .. }
                | StepflowError::Coercion { .. }
                | StepflowError::Workload { .. }
                | StepflowError::StepLimitExceeded { .. }
        )
    }

    /// Short stable label used in logs and run events.
    pub fn category(&self) -> &'static str {
        match self {
            StepflowError::Reference { .. } => "reference",
            StepflowError::Coercion { .. } => "coercion",
            StepflowError::Workload { .. } => "workload",
            StepflowError::StepLimitExceeded { .. } => "step_limit",
            StepflowError::Config(_) => "config",
            StepflowError::Parse { .. } => "parse",
            StepflowError::Io(_) => "io",
            StepflowError::Json(_) => "json",
            StepflowError::Other(_) => "other",
        }
    }
}

/// A convenience alias for `Result<T, StepflowError>`.
pub type Result<T> = std::result::Result<T, StepflowError>;

// ---------------------------------------------------------------------------
// Phase: lifecycle of an execution context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initial,
    Parsing,
    Parsed,
    Planning,
    Planned,
    Executing,
    Executed,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initial => "initial",
            Phase::Parsing => "parsing",
            Phase::Parsed => "parsed",
            Phase::Planning => "planning",
            Phase::Planned => "planned",
            Phase::Executing => "executing",
            Phase::Executed => "executed",
            Phase::Finished => "finished",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint: serializable run-state snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Session/thread correlation id of the run that wrote this snapshot.
    pub thread_id: String,
    /// Agent id of the workflow; a checkpoint is only restored into the
    /// same workflow.
    pub namespace: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub last_step: Option<String>,
    pub visited: Vec<String>,
    pub state: serde_json::Map<String, serde_json::Value>,
}

impl Checkpoint {
    /// Serialize this checkpoint to JSON and write it to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), thread_id = %self.thread_id, "Checkpoint written");
        Ok(())
    }

    /// Read a checkpoint from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&data)?;
        Ok(checkpoint)
    }
}
