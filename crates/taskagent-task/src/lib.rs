//! `TaskAgent` worker-side task lifecycle.
//!
//! A task type is a [`TaskType`] record: a name, optional validation sources,
//! a start behaviour and a table of named steps. The worker binary looks the
//! type up in a [`TaskRegistry`], then [`run_worker`] drives one
//! [`TaskContext`] through validate, start, steps and finish while speaking
//! the NDJSON IPC protocol with the control process.

pub mod builtin;
pub mod context;
pub mod error;
pub mod log;
pub mod process;
pub mod subtask;
pub mod task_type;
pub mod validate;
pub mod worker;

pub use builtin::builtin_registry;
pub use context::{TaskContext, TaskState};
pub use error::{TaskError, ValidationError, WorkerError};
pub use subtask::{SubtaskEvent, SubtaskHandle, SubtaskRegistry};
pub use task_type::{StartFn, StepFn, StepFuture, StepSpec, TaskRegistry, TaskType};
pub use worker::run_worker;

use taskagent_core::ipc::WorkerMessage;
use tokio::sync::mpsc;

/// Channel carrying everything a task emits towards the parent process.
pub type Outbound = mpsc::UnboundedSender<WorkerMessage>;

/// Queue `msg` for the parent. A closed channel means the IPC writer is gone
/// and the message is dropped.
pub(crate) fn emit(outbound: &Outbound, msg: WorkerMessage) {
    if outbound.send(msg).is_err() {
        tracing::debug!("IPC writer closed, dropping worker message");
    }
}
