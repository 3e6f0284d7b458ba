//! Message types for the worker IPC protocol.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{LogEntry, TaskRequest};

/// `type` tags understood by the parent.
pub const WORKER_MESSAGE_KINDS: &[&str] = &["ready", "event", "subtask", "log", "exception"];

/// `action` tags understood by the worker.
pub const PARENT_MESSAGE_ACTIONS: &[&str] = &["start", "subtask"];

/// Messages a worker sends to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker finished bootstrapping and can accept `start`.
    Ready,
    /// Task lifecycle event.
    Event { name: String, event: Value },
    /// Request to delegate sub-work to another resource type.
    Subtask {
        id: String,
        resource: String,
        task: String,
        msg: Value,
    },
    /// Structured task log entry.
    Log { entry: LogEntry },
    /// Uncaught fault; the worker exits non-zero right after sending this.
    Exception { error: ExceptionInfo },
}

/// Description of an uncaught worker fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// Messages the parent sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Begin executing `req`.
    Start {
        req: TaskRequest,
        #[serde(rename = "tasksPath")]
        tasks_path: PathBuf,
    },
    /// One event of a delegated subtask, addressed by subtask id.
    Subtask {
        id: String,
        name: String,
        event: Value,
    },
}

/// A decoded line: either a known message or an unknown kind to be warned
/// about and skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<T> {
    Known(T),
    Unknown { kind: String, payload: Value },
}
