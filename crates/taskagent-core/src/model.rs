//! Task data model shared by the control process and worker processes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle event emitted when a task starts running.
pub const EVENT_START: &str = "start";
/// Observational progress update.
pub const EVENT_PROGRESS: &str = "progress";
/// Non-fatal (or, followed by `finish`, fatal) task failure.
pub const EVENT_ERROR: &str = "error";
/// Terminal event; exactly one per task execution.
pub const EVENT_FINISH: &str = "finish";
/// Emitted after parameters passed validation.
pub const EVENT_VALIDATE: &str = "validate";

/// Body field carrying the sender-generated task id.
pub const FIELD_TASK_ID: &str = "task_id";
/// Body field carrying the sender's client id.
pub const FIELD_CLIENT_ID: &str = "client_id";

/// Event name emitted when `step` begins.
pub fn step_start_event(step: &str) -> String {
    format!("{EVENT_START}:{step}")
}

/// Event name emitted when `step` completes.
pub fn step_end_event(step: &str) -> String {
    format!("end:{step}")
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A request to execute one task. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Task type name.
    pub task: String,
    /// Task parameters, including the `task_id`/`client_id` stamps.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Correlation key for every event of this request.
    #[serde(default)]
    pub task_id: String,
    /// Identity of the party that submitted the request.
    #[serde(default)]
    pub client_id: String,
}

impl TaskRequest {
    /// Build a request from a messaging body, recovering the correlation ids
    /// the sender stamped into it.
    pub fn from_body(task: impl Into<String>, body: Value) -> Self {
        let params = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let field = |name: &str| {
            params
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let task_id = field(FIELD_TASK_ID);
        let client_id = field(FIELD_CLIENT_ID);
        Self {
            task: task.into(),
            params,
            task_id,
            client_id,
        }
    }
}

/// A named lifecycle event with a structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub name: String,
    pub payload: Value,
}

impl TaskEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Whether this is the terminal `finish` event.
    pub fn is_finish(&self) -> bool {
        self.name == EVENT_FINISH
    }

    /// Whether this is an `error` event.
    pub fn is_error(&self) -> bool {
        self.name == EVENT_ERROR
    }
}

/// Severity of a structured task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One entry of a task's structured log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// A leveled message.
    Message {
        timestamp: String,
        level: LogLevel,
        message: Value,
    },
    /// A finished subprocess execution.
    Process {
        timestamp: String,
        level: LogLevel,
        process: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        exitstatus: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl LogEntry {
    /// Build a leveled message entry stamped with the current time.
    pub fn message(level: LogLevel, message: impl Into<Value>) -> Self {
        Self::Message {
            timestamp: now_iso(),
            level,
            message: message.into(),
        }
    }

    pub const fn level(&self) -> LogLevel {
        match self {
            Self::Message { level, .. } | Self::Process { level, .. } => *level,
        }
    }

    /// Human-readable one-line summary used when re-logging the entry.
    pub fn summary(&self) -> String {
        match self {
            Self::Message { message, .. } => match message {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Process {
                process,
                args,
                exitstatus,
                ..
            } => format!(
                "process {process} {} exited with {}",
                args.join(" "),
                exitstatus.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_recovers_correlation_ids_from_body() {
        let req = TaskRequest::from_body(
            "demo",
            json!({"task_id": "t-1", "client_id": "c-1", "size": 3}),
        );
        assert_eq!(req.task, "demo");
        assert_eq!(req.task_id, "t-1");
        assert_eq!(req.client_id, "c-1");
        assert_eq!(req.params.get("size"), Some(&json!(3)));
    }

    #[test]
    fn request_serializes_camel_case() {
        let req = TaskRequest::from_body("demo", json!({"task_id": "t", "client_id": "c"}));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["taskId"], "t");
        assert_eq!(value["clientId"], "c");
    }

    #[test]
    fn non_object_body_is_wrapped() {
        let req = TaskRequest::from_body("demo", json!(42));
        assert_eq!(req.params.get("value"), Some(&json!(42)));
        assert!(req.task_id.is_empty());
    }

    #[test]
    fn step_event_names() {
        assert_eq!(step_start_event("silly"), "start:silly");
        assert_eq!(step_end_event("silly"), "end:silly");
    }

    #[test]
    fn log_entry_is_tagged_by_type() {
        let entry = LogEntry::message(LogLevel::Info, "hello");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["level"], "info");
        assert_eq!(value["message"], "hello");
    }
}
