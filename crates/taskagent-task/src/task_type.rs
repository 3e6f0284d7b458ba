//! Task type records and the registry the worker resolves them from.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use taskagent_core::TaskRequest;

use crate::context::TaskContext;
use crate::error::{TaskError, ValidationError};

/// Boxed future returned by start behaviours and step functions.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>>;

/// A task type's start behaviour, entered after successful validation.
pub type StartFn = for<'a> fn(&'a mut TaskContext) -> StepFuture<'a>;

/// Body of a named step. Receives the arguments passed to
/// [`TaskContext::run_step`].
pub type StepFn = for<'a> fn(&'a mut TaskContext, Value) -> StepFuture<'a>;

/// Parameter predicate run after schema checks.
pub type ValidateFn = fn(&TaskRequest) -> Result<(), ValidationError>;

/// A named, event-bracketed unit of work.
#[derive(Clone)]
pub struct StepSpec {
    pub run: StepFn,
    pub description: Option<String>,
    /// Progress value emitted when the step completes.
    pub progress: Option<u32>,
}

impl StepSpec {
    pub fn new(run: StepFn) -> Self {
        Self {
            run,
            description: None,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn with_progress(mut self, progress: u32) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Everything that defines a concrete task type.
#[derive(Clone)]
pub struct TaskType {
    name: String,
    schema: Option<Value>,
    validate: Option<ValidateFn>,
    start: StartFn,
    steps: HashMap<String, StepSpec>,
}

impl TaskType {
    pub fn new(name: impl Into<String>, start: StartFn) -> Self {
        Self {
            name: name.into(),
            schema: None,
            validate: None,
            start,
            steps: HashMap::new(),
        }
    }

    /// Attach a JSON schema the request parameters must satisfy.
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_validate(mut self, validate: ValidateFn) -> Self {
        self.validate = Some(validate);
        self
    }

    #[must_use]
    pub fn with_step(mut self, name: impl Into<String>, step: StepSpec) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    pub const fn predicate(&self) -> Option<ValidateFn> {
        self.validate
    }

    pub const fn start_fn(&self) -> StartFn {
        self.start
    }

    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.get(name)
    }
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("description", &self.description)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        steps.sort_unstable();
        f.debug_struct("TaskType")
            .field("name", &self.name)
            .field("schema", &self.schema.is_some())
            .field("predicate", &self.validate.is_some())
            .field("steps", &steps)
            .finish_non_exhaustive()
    }
}

/// Task types available to a worker, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    types: HashMap<String, Arc<TaskType>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task_type`, replacing any type with the same name.
    pub fn register(&mut self, task_type: TaskType) {
        self.types
            .insert(task_type.name().to_string(), Arc::new(task_type));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskType>> {
        self.types.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
