//! Dotted reference paths into the run state.
//!
//! `p1_output.result.items.0` names slot `p1_output`, then key `result`,
//! then key `items`, then list position `0`. Resolution never substitutes
//! defaults: any segment that does not resolve fails with a reference error.

use serde_json::Value;
use stepflow_types::{Record, Result, StepflowError};

/// Split a path into its segments, rejecting empty paths and empty segments.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    let path = path.trim();
    if path.is_empty() {
        return Err(StepflowError::reference(path, "empty reference path"));
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StepflowError::reference(path, "empty path segment"));
    }
    Ok(parts)
}

/// The first segment of `path`: the state slot it reads.
pub fn root(path: &str) -> Option<&str> {
    path.trim().split('.').next().filter(|s| !s.is_empty())
}

/// Borrow the value at `path`.
///
/// A `null` reached before the last segment is an error; a `null` at the
/// last segment is returned as-is.
pub fn lookup<'a, R: Record + ?Sized>(path: &str, root: &'a R) -> Result<&'a Value> {
    let parts = segments(path)?;
    let first = parts[0];
    let mut current = root
        .get(first)
        .ok_or_else(|| StepflowError::reference(path, format!("no state field '{first}'")))?;
    for (i, segment) in parts.iter().enumerate().skip(1) {
        if current.is_null() {
            return Err(StepflowError::reference(
                path,
                format!("'{}' is null", parts[..i].join(".")),
            ));
        }
        current = Record::get(current, segment).ok_or_else(|| {
            StepflowError::reference(
                path,
                format!("segment '{segment}' not found in '{}'", parts[..i].join(".")),
            )
        })?;
    }
    Ok(current)
}

/// Clone the value at `path`. See [`lookup`].
pub fn resolve<R: Record + ?Sized>(path: &str, root: &R) -> Result<Value> {
    lookup(path, root).cloned()
}
