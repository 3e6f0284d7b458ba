//! The task state machine.
//!
//! A [`TaskContext`] moves `Created -> Validating -> Running -> Finished`, or
//! `Running -> Failed` through [`TaskContext::fatal`]. Every transition and
//! observation is emitted as a lifecycle event on the outbound IPC channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use taskagent_core::TaskRequest;
use taskagent_core::ipc::WorkerMessage;
use taskagent_core::model::{
    EVENT_ERROR, EVENT_FINISH, EVENT_PROGRESS, EVENT_START, EVENT_VALIDATE, now_iso,
    step_end_event, step_start_event,
};
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::log::TaskLog;
use crate::process::{self, ProcessOutput};
use crate::subtask::{SubtaskHandle, SubtaskRegistry};
use crate::task_type::TaskType;
use crate::validate::validate_request;
use crate::{Outbound, emit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Validating,
    Running,
    Finished,
    Failed,
}

impl TaskState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// One task execution inside a worker.
pub struct TaskContext {
    task_type: Arc<TaskType>,
    req: TaskRequest,
    tasks_path: PathBuf,
    state: TaskState,
    outbound: Outbound,
    log: TaskLog,
    subtasks: SubtaskRegistry,
}

impl TaskContext {
    pub fn new(
        task_type: Arc<TaskType>,
        req: TaskRequest,
        tasks_path: PathBuf,
        outbound: Outbound,
        subtasks: SubtaskRegistry,
    ) -> Self {
        Self {
            task_type,
            req,
            tasks_path,
            state: TaskState::Created,
            log: TaskLog::new(outbound.clone()),
            outbound,
            subtasks,
        }
    }

    pub const fn request(&self) -> &TaskRequest {
        &self.req
    }

    pub const fn params(&self) -> &Map<String, Value> {
        &self.req.params
    }

    /// String parameter `name`, or a [`TaskError::Param`].
    pub fn param_str(&self, name: &str) -> Result<&str, TaskError> {
        self.req
            .params
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::Param(name.to_string()))
    }

    pub fn tasks_path(&self) -> &Path {
        &self.tasks_path
    }

    pub const fn state(&self) -> TaskState {
        self.state
    }

    /// Whether `finish` has been emitted.
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The structured log sink.
    pub fn log(&mut self) -> &mut TaskLog {
        &mut self.log
    }

    /// Emit a named lifecycle event.
    pub fn event(&self, name: impl Into<String>, payload: Value) {
        let name = name.into();
        debug!(task = %self.task_type.name(), event = %name, "Emitting task event");
        emit(&self.outbound, WorkerMessage::Event {
            name,
            event: payload,
        });
    }

    /// Observational progress update.
    pub fn progress(&self, value: u32) {
        self.event(EVENT_PROGRESS, json!({ "value": value }));
    }

    /// Report a non-fatal error. The task keeps running.
    pub fn error(&self, message: impl Into<String>, details: Option<Value>) {
        let mut payload = Map::new();
        payload.insert("error".to_string(), Value::String(message.into()));
        if let Some(details) = details {
            payload.insert("details".to_string(), details);
        }
        self.event(EVENT_ERROR, Value::Object(payload));
    }

    /// Report an error and finish the task as failed.
    pub fn fatal(&mut self, message: impl Into<String>, details: Option<Value>) {
        self.error(message, details);
        self.state = TaskState::Failed;
        self.finish(None);
    }

    /// Emit the terminal `finish` event with the accumulated log attached.
    ///
    /// Must be called at most once per task; a second call emits a second
    /// `finish`.
    pub fn finish(&mut self, result: Option<Value>) {
        let mut payload = match result {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let log = self
            .log
            .entries()
            .iter()
            .filter_map(|entry| serde_json::to_value(entry).ok())
            .collect();
        payload.insert("log".to_string(), Value::Array(log));

        if self.state != TaskState::Failed {
            self.state = TaskState::Finished;
        }
        info!(task = %self.task_type.name(), state = ?self.state, "Task finished");
        self.event(EVENT_FINISH, Value::Object(payload));
    }

    /// Run the named step, bracketed by `start:<step>` and `end:<step>`.
    ///
    /// The step's configured progress and `end:<step>` are emitted once the
    /// step body completes, whether or not it succeeded.
    pub async fn run_step(&mut self, name: &str, args: Value) -> Result<Value, TaskError> {
        let step = self
            .task_type
            .step(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownStep(name.to_string()))?;

        self.event(
            step_start_event(name),
            json!({ "timestamp": now_iso(), "description": step.description }),
        );
        let result = (step.run)(self, args).await;

        if let Some(progress) = step.progress {
            self.progress(progress);
        }
        self.event(step_end_event(name), json!({ "timestamp": now_iso() }));
        result
    }

    /// Delegate work to another resource type.
    ///
    /// Emits a `subtask` request upward and returns a handle receiving every
    /// event relayed back for the generated id.
    pub fn sub_task(&self, resource: &str, task: &str, msg: Value) -> SubtaskHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = self.subtasks.register(&id);
        info!(subtask_id = %id, resource, task, "Delegating subtask");
        emit(&self.outbound, WorkerMessage::Subtask {
            id,
            resource: resource.to_string(),
            task: task.to_string(),
            msg,
        });
        handle
    }

    /// Run a subprocess and record it in the task log.
    pub async fn run_process(
        &mut self,
        bin: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessOutput, TaskError> {
        let output = process::capture(bin, args, env).await?;
        self.log.process(
            bin,
            args,
            env,
            output.exitstatus,
            &output.stdout,
            &output.stderr,
        );
        Ok(output)
    }

    /// Drive the whole lifecycle: validate, start, then whatever the start
    /// behaviour does.
    ///
    /// A start behaviour that fails before finishing is turned into `fatal`.
    pub async fn execute(&mut self) {
        let task_type = Arc::clone(&self.task_type);
        self.state = TaskState::Validating;

        match validate_request(&task_type, &self.req, &self.tasks_path) {
            Ok(true) => self.event(EVENT_VALIDATE, json!({})),
            Ok(false) => {}
            Err(err) => {
                warn!(
                    task = %task_type.name(),
                    diagnostics = ?err.diagnostics,
                    "Task parameters failed validation"
                );
                self.error(err.to_string(), Some(json!(err.diagnostics)));
                self.finish(None);
                return;
            }
        }

        self.state = TaskState::Running;
        self.event(EVENT_START, json!({ "progress": 0 }));

        let start = task_type.start_fn();
        if let Err(err) = start(self).await {
            if self.is_terminal() {
                warn!(task = %task_type.name(), error = %err, "Task failed after finishing");
            } else {
                self.fatal(err.to_string(), err.details());
            }
        }
    }
}
