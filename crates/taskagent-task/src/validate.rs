//! Parameter validation.
//!
//! Sources run in order: the task type's embedded schema, an optional
//! `<tasks_path>/<task>/schema.json` file, then the task type's predicate.
//! The first failing source wins.

use std::path::Path;

use jsonschema::JSONSchema;
use serde_json::Value;
use taskagent_core::TaskRequest;

use crate::error::ValidationError;
use crate::task_type::TaskType;

/// File name looked up under `<tasks_path>/<task>/`.
pub const SCHEMA_FILE: &str = "schema.json";

/// Validate `req` against every source `task_type` has.
///
/// Returns `Ok(true)` when at least one source ran, `Ok(false)` when there
/// was nothing to check.
pub fn validate_request(
    task_type: &TaskType,
    req: &TaskRequest,
    tasks_path: &Path,
) -> Result<bool, ValidationError> {
    let params = Value::Object(req.params.clone());
    let mut checked = false;

    if let Some(schema) = task_type.schema() {
        check_schema(schema, &params)?;
        checked = true;
    }

    if let Some(schema) = load_schema_file(tasks_path, task_type.name())? {
        check_schema(&schema, &params)?;
        checked = true;
    }

    if let Some(predicate) = task_type.predicate() {
        predicate(req)?;
        checked = true;
    }

    Ok(checked)
}

fn load_schema_file(tasks_path: &Path, task: &str) -> Result<Option<Value>, ValidationError> {
    let path = tasks_path.join(task).join(SCHEMA_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| {
        ValidationError::single(format!("Failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map(Some).map_err(|e| {
        ValidationError::single(format!("Failed to parse {}: {e}", path.display()))
    })
}

/// Check `instance` against `schema`, collecting every violation.
pub fn check_schema(schema: &Value, instance: &Value) -> Result<(), ValidationError> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| ValidationError::single(format!("Invalid schema: {e}")))?;
    let diagnostics: Vec<String> = match compiled.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect(),
    };
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(diagnostics))
    }
}
