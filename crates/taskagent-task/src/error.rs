//! Error types raised inside the worker.

use serde_json::Value;
use thiserror::Error;

/// Runtime failure inside a task's start behaviour or one of its steps.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task-defined failure with optional structured details.
    #[error("{message}")]
    Failed {
        message: String,
        details: Option<Value>,
    },

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Missing or invalid parameter: {0}")]
    Param(String),

    #[error("Failed to run {bin}: {reason}")]
    Process { bin: String, reason: String },

    #[error("Subtask {0} closed before finishing")]
    SubtaskClosed(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
        }
    }

    /// Structured details to attach to the `error` event, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Failed { details, .. } => details.clone(),
            _ => None,
        }
    }
}

/// Task parameters were rejected by a schema or predicate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Task parameters failed validation")]
pub struct ValidationError {
    pub diagnostics: Vec<String>,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<String>) -> Self {
        Self { diagnostics }
    }

    pub fn single(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostics: vec![diagnostic.into()],
        }
    }
}

/// Faults of the worker runtime itself, reported as `exception` messages.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Unknown task type: {0}")]
    UnknownTask(String),

    #[error("Parent closed the IPC channel before sending start")]
    NoStart,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
