//! Worker process runtime.
//!
//! Speaks the NDJSON IPC protocol with the control process: announce
//! `ready`, wait for `start`, execute exactly one task, route `subtask`
//! replies to their handles. The returned exit code is non-zero whenever the
//! task did not reach `finish` on its own.

use std::any::Any;
use std::path::PathBuf;

use taskagent_core::TaskRequest;
use taskagent_core::ipc::{
    ExceptionInfo, Inbound, ParentMessage, WorkerMessage, decode_parent_line, encode_line,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::TaskContext;
use crate::error::WorkerError;
use crate::subtask::SubtaskRegistry;
use crate::task_type::TaskRegistry;
use crate::{Outbound, emit};

/// Exit status after the task emitted `finish`.
pub const EXIT_OK: i32 = 0;
/// Exit status for faults and tasks that never finished.
pub const EXIT_FAULT: i32 = 1;

/// Run the task named `task_name` from `registry`, reading parent messages
/// from `reader` and writing worker messages to `writer`.
pub async fn run_worker<R, W>(registry: &TaskRegistry, task_name: &str, reader: R, writer: W) -> i32
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_messages(rx, writer));

    let code = match drive(registry, task_name, reader, &tx).await {
        Ok(code) => code,
        Err(err) => {
            error!(task = task_name, error = %err, "Worker fault");
            emit(&tx, exception(&err));
            EXIT_FAULT
        }
    };

    drop(tx);
    if let Err(e) = writer_task.await {
        error!(error = %e, "IPC writer task failed");
    }
    code
}

async fn drive<R>(
    registry: &TaskRegistry,
    task_name: &str,
    reader: R,
    tx: &Outbound,
) -> Result<i32, WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let task_type = registry
        .get(task_name)
        .ok_or_else(|| WorkerError::UnknownTask(task_name.to_string()))?;

    debug!(task = task_name, "Worker ready, waiting for start");
    emit(tx, WorkerMessage::Ready);

    let mut lines = BufReader::new(reader).lines();
    let (req, tasks_path) = wait_for_start(&mut lines).await?;
    info!(
        task = task_name,
        task_id = %req.task_id,
        client_id = %req.client_id,
        "Starting task"
    );

    let subtasks = SubtaskRegistry::default();
    let reader_task = tokio::spawn(route_replies(lines, subtasks.clone()));

    let ctx = TaskContext::new(task_type, req, tasks_path, tx.clone(), subtasks);
    let outcome = tokio::spawn(async move {
        let mut ctx = ctx;
        ctx.execute().await;
        ctx.is_terminal()
    })
    .await;
    reader_task.abort();

    match outcome {
        Ok(true) => Ok(EXIT_OK),
        Ok(false) => {
            warn!(task = task_name, "Task returned without finishing");
            Ok(EXIT_FAULT)
        }
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            Err(WorkerError::Panicked(panic_message(&*payload)))
        }
        Err(join_err) => Err(WorkerError::Panicked(join_err.to_string())),
    }
}

async fn wait_for_start<R>(lines: &mut Lines<BufReader<R>>) -> Result<(TaskRequest, PathBuf), WorkerError>
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        match decode_parent_line(&line) {
            Ok(Inbound::Known(ParentMessage::Start { req, tasks_path })) => {
                return Ok((req, tasks_path));
            }
            Ok(Inbound::Known(ParentMessage::Subtask { id, .. })) => {
                warn!(subtask_id = %id, "Subtask reply before start, ignoring");
            }
            Ok(Inbound::Unknown { kind, .. }) => {
                warn!(action = %kind, "Unknown task action");
            }
            Err(e) => warn!(error = %e, "Ignoring malformed parent message"),
        }
    }
    Err(WorkerError::NoStart)
}

async fn route_replies<R>(mut lines: Lines<BufReader<R>>, subtasks: SubtaskRegistry)
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from parent");
                break;
            }
        };
        match decode_parent_line(&line) {
            Ok(Inbound::Known(ParentMessage::Subtask { id, name, event })) => {
                if !subtasks.dispatch(&id, &name, event) {
                    warn!(subtask_id = %id, event = %name, "No live subtask for reply");
                }
            }
            Ok(Inbound::Known(ParentMessage::Start { .. })) => {
                warn!("Task already started, ignoring second start");
            }
            Ok(Inbound::Unknown { kind, .. }) => {
                warn!(action = %kind, "Unknown task action");
            }
            Err(e) => warn!(error = %e, "Ignoring malformed parent message"),
        }
    }
    debug!("Parent channel closed");
}

async fn write_messages<W>(mut rx: mpsc::UnboundedReceiver<WorkerMessage>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let line = match encode_line(&msg) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to encode worker message");
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!("Failed to write to parent: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!("Failed to write newline: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush parent channel: {}", e);
            break;
        }
    }
}

fn exception(err: &WorkerError) -> WorkerMessage {
    WorkerMessage::Exception {
        error: ExceptionInfo {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::builtin::builtin_registry;
    use crate::error::TaskError;
    use crate::task_type::{StepFuture, TaskType};
    use serde_json::{Value, json};
    use taskagent_core::ipc::decode_worker_line;
    use tokio::io::{DuplexStream, duplex};

    struct Harness {
        to_worker: DuplexStream,
        from_worker: Lines<BufReader<DuplexStream>>,
        worker: tokio::task::JoinHandle<i32>,
    }

    fn spawn_worker(registry: TaskRegistry, task: &str) -> Harness {
        let (to_worker, worker_stdin) = duplex(64 * 1024);
        let (worker_stdout, from_worker) = duplex(64 * 1024);
        let task = task.to_string();
        let worker = tokio::spawn(async move {
            run_worker(&registry, &task, worker_stdin, worker_stdout).await
        });
        Harness {
            to_worker,
            from_worker: BufReader::new(from_worker).lines(),
            worker,
        }
    }

    impl Harness {
        async fn send(&mut self, msg: &ParentMessage) {
            let line = encode_line(msg).unwrap();
            self.to_worker.write_all(line.as_bytes()).await.unwrap();
            self.to_worker.write_all(b"\n").await.unwrap();
        }

        async fn start(&mut self, task: &str, params: Value) {
            self.send(&ParentMessage::Start {
                req: TaskRequest::from_body(task, params),
                tasks_path: PathBuf::from("/nonexistent"),
            })
            .await;
        }

        async fn next(&mut self) -> Option<WorkerMessage> {
            let line = self.from_worker.next_line().await.unwrap()?;
            match decode_worker_line(&line).unwrap() {
                Inbound::Known(msg) => Some(msg),
                Inbound::Unknown { kind, .. } => panic!("unexpected kind {kind}"),
            }
        }

        async fn drain(&mut self) -> Vec<WorkerMessage> {
            let mut out = Vec::new();
            while let Some(msg) = self.next().await {
                out.push(msg);
            }
            out
        }
    }

    fn event_names(msgs: &[WorkerMessage]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| match m {
                WorkerMessage::Event { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn explode(ctx: &mut TaskContext) -> StepFuture<'_> {
        Box::pin(explode_inner(ctx))
    }

    async fn explode_inner(ctx: &mut TaskContext) -> Result<Value, TaskError> {
        ctx.log().info("about to explode");
        panic!("kaboom")
    }

    fn delegate_and_echo(ctx: &mut TaskContext) -> StepFuture<'_> {
        Box::pin(delegate_and_echo_inner(ctx))
    }

    async fn delegate_and_echo_inner(ctx: &mut TaskContext) -> Result<Value, TaskError> {
        let handle = ctx.sub_task("remote", "work", json!({}));
        let payload = handle.finished().await?;
        ctx.finish(Some(json!({"remote": payload})));
        Ok(Value::Null)
    }

    #[tokio::test]
    async fn demo_task_round_trip() {
        let mut h = spawn_worker(builtin_registry(), "demo");
        assert_eq!(h.next().await, Some(WorkerMessage::Ready));
        h.start("demo", json!({"task_id": "t1", "client_id": "c1"})).await;

        let msgs = h.drain().await;
        assert_eq!(event_names(&msgs), vec!["start", "progress", "finish"]);
        assert!(
            msgs.iter()
                .any(|m| matches!(m, WorkerMessage::Log { .. }))
        );
        let finish = msgs
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Event { name, event } if name == "finish" => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(finish["hello"], "world");
        assert!(finish["log"].is_array());
        assert_eq!(h.worker.await.unwrap(), EXIT_OK);
    }

    #[tokio::test]
    async fn unfinished_task_exits_non_zero() {
        let mut h = spawn_worker(builtin_registry(), "error");
        assert_eq!(h.next().await, Some(WorkerMessage::Ready));
        h.start("error", json!({})).await;

        let msgs = h.drain().await;
        let names = event_names(&msgs);
        assert_eq!(names.first().map(String::as_str), Some("start"));
        assert!(names.contains(&"start:silly".to_string()));
        assert!(!names.contains(&"finish".to_string()));
        assert_eq!(h.worker.await.unwrap(), EXIT_FAULT);
    }

    #[tokio::test]
    async fn panic_is_reported_as_exception() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskType::new("explode", explode));
        let mut h = spawn_worker(registry, "explode");
        h.next().await;
        h.start("explode", json!({})).await;

        let msgs = h.drain().await;
        let exception = msgs.iter().find_map(|m| match m {
            WorkerMessage::Exception { error } => Some(error.message.clone()),
            _ => None,
        });
        assert_eq!(exception.as_deref(), Some("Task panicked: kaboom"));
        assert_eq!(h.worker.await.unwrap(), EXIT_FAULT);
    }

    #[tokio::test]
    async fn unknown_task_is_a_fault() {
        let mut h = spawn_worker(builtin_registry(), "nope");
        let msg = h.next().await;
        assert!(matches!(
            msg,
            Some(WorkerMessage::Exception { error }) if error.message.contains("nope")
        ));
        assert_eq!(h.worker.await.unwrap(), EXIT_FAULT);
    }

    #[tokio::test]
    async fn parent_closing_before_start_is_a_fault() {
        let mut h = spawn_worker(builtin_registry(), "demo");
        h.next().await;
        h.send(&ParentMessage::Subtask {
            id: "early".to_string(),
            name: "progress".to_string(),
            event: json!({}),
        })
        .await;
        h.to_worker.shutdown().await.unwrap();
        let msgs = h.drain().await;
        assert!(matches!(
            msgs.as_slice(),
            [WorkerMessage::Exception { .. }]
        ));
        assert_eq!(h.worker.await.unwrap(), EXIT_FAULT);
    }

    #[tokio::test]
    async fn subtask_replies_are_routed_by_id() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskType::new("delegating", delegate_and_echo));
        let mut h = spawn_worker(registry, "delegating");
        h.next().await;
        h.start("delegating", json!({})).await;

        assert!(matches!(h.next().await, Some(WorkerMessage::Event { name, .. }) if name == "start"));
        let id = match h.next().await {
            Some(WorkerMessage::Subtask { id, resource, .. }) => {
                assert_eq!(resource, "remote");
                id
            }
            other => panic!("expected subtask request, got {other:?}"),
        };

        h.send(&ParentMessage::Subtask {
            id: "someone-else".to_string(),
            name: "finish".to_string(),
            event: json!({"wrong": true}),
        })
        .await;
        h.send(&ParentMessage::Subtask {
            id: id.clone(),
            name: "progress".to_string(),
            event: json!({"value": 50}),
        })
        .await;
        h.send(&ParentMessage::Subtask {
            id,
            name: "finish".to_string(),
            event: json!({"built": true}),
        })
        .await;

        let msgs = h.drain().await;
        let finish = msgs
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Event { name, event } if name == "finish" => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(finish["remote"]["built"], true);
        assert_eq!(h.worker.await.unwrap(), EXIT_OK);
    }
}
