//! Worker subprocess lifecycle.
//!
//! The [`ChildProcessRunner`] launches one `taskagent-worker` process per task
//! request, speaks the NDJSON IPC protocol over its stdio, records everything
//! the worker reports in the [`TaskHistory`], and relays lifecycle events and
//! subtask requests to whoever dispatched the request.

pub mod history;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use taskagent_core::config::AgentConfig;
use taskagent_core::ipc::{Inbound, ParentMessage, WorkerMessage, decode_worker_line, encode_line};
use taskagent_core::model::{EVENT_ERROR, EVENT_FINISH};
use taskagent_core::truncate::{MAX_LOG_STRING_LEN, truncate_str, truncate_strings};
use taskagent_core::{LogEntry, LogLevel, TaskEvent, TaskRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{debug, error, info, trace, warn};

pub use history::{ChildStatus, HistoryEntry, RecordedMessage, TaskHistory};

/// Kill switches of live children keyed by pid.
type KillSwitches = Arc<RwLock<HashMap<u32, Arc<Notify>>>>;

/// Environment variable telling a worker where to write its log file.
pub const WORKER_LOGFILE_ENV: &str = "TASKAGENT_LOGFILE";

/// Settings for spawning workers.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub worker_bin: PathBuf,
    pub tasks_path: PathBuf,
    pub task_log_dir: PathBuf,
    pub max_history: usize,
    pub max_log_string_len: usize,
}

impl RunnerConfig {
    pub fn new(worker_bin: PathBuf, tasks_path: PathBuf, task_log_dir: PathBuf) -> Self {
        Self {
            worker_bin,
            tasks_path,
            task_log_dir,
            max_history: 1000,
            max_log_string_len: MAX_LOG_STRING_LEN,
        }
    }

    pub fn from_agent_config(config: &AgentConfig, worker_bin: PathBuf) -> Self {
        Self {
            worker_bin,
            tasks_path: config.tasks_path.clone(),
            task_log_dir: config.task_log_dir.clone(),
            max_history: config.max_history,
            max_log_string_len: config.max_log_string_len,
        }
    }
}

/// Subtask delegation requested by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskRequest {
    pub id: String,
    pub resource: String,
    pub task: String,
    pub msg: Value,
}

/// Something a child reported that its dispatcher must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Event(TaskEvent),
    Subtask(SubtaskRequest),
}

/// Writes parent messages into one worker's stdin.
#[derive(Debug, Clone)]
pub struct WorkerSender {
    pid: u32,
    tx: mpsc::UnboundedSender<ParentMessage>,
}

impl WorkerSender {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Relay one event of subtask `id` to the worker. Returns `false` once
    /// the worker's stdin is gone.
    pub fn send_subtask(&self, id: &str, name: &str, event: Value) -> bool {
        self.tx
            .send(ParentMessage::Subtask {
                id: id.to_string(),
                name: name.to_string(),
                event,
            })
            .is_ok()
    }
}

/// The dispatcher's view of one running child.
///
/// [`ChildHandle::next`] yields events until the child is gone; the last
/// event of every child is `finish`, synthesized if the worker never sent one.
#[derive(Debug)]
pub struct ChildHandle {
    pid: u32,
    task_id: String,
    sender: WorkerSender,
    events: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildHandle {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn sender(&self) -> WorkerSender {
        self.sender.clone()
    }

    pub async fn next(&mut self) -> Option<ChildEvent> {
        self.events.recv().await
    }
}

/// Errors from launching a worker.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to create task log directory {}: {source}", .path.display())]
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open worker log {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to spawn worker {}: {source}", .bin.display())]
    Spawn {
        bin: PathBuf,
        source: std::io::Error,
    },

    #[error("Worker for {task} exited before reporting a pid")]
    NoPid { task: String },

    #[error("Worker for {task} has no {stream} pipe")]
    MissingPipe { task: String, stream: &'static str },
}

/// Launches and supervises worker processes.
#[derive(Clone)]
pub struct ChildProcessRunner {
    config: Arc<RunnerConfig>,
    children: KillSwitches,
    history: TaskHistory,
}

impl ChildProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let history = TaskHistory::new(config.max_history);
        Self {
            config: Arc::new(config),
            children: Arc::new(RwLock::new(HashMap::new())),
            history,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Launch a worker for `req`.
    ///
    /// The worker is told to start as soon as it reports `ready`. Events are
    /// delivered through the returned handle.
    pub async fn dispatch(&self, req: TaskRequest) -> Result<ChildHandle, RunnerError> {
        let log_path = self.prepare_log_file(&req.task).await?;

        let mut cmd = Command::new(&self.config.worker_bin);
        cmd.arg(&req.task)
            .env(WORKER_LOGFILE_ENV, &log_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            bin: self.config.worker_bin.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| RunnerError::NoPid {
            task: req.task.clone(),
        })?;
        let (stdin, stdout, stderr) = take_pipes(&mut child, &req.task)?;

        info!(
            pid,
            task = %req.task,
            task_id = %req.task_id,
            log = %log_path.display(),
            "Worker spawned"
        );

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_stdin(pid, stdin, stdin_rx));
        tokio::spawn(read_stderr(pid, req.task.clone(), stderr));

        let kill = Arc::new(Notify::new());
        self.children.write().await.insert(pid, Arc::clone(&kill));
        self.history
            .insert(HistoryEntry::new(pid, &req.task, &req.task_id, req.params.clone()))
            .await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ChildHandle {
            pid,
            task_id: req.task_id.clone(),
            sender: WorkerSender {
                pid,
                tx: stdin_tx.clone(),
            },
            events: events_rx,
        };

        let monitor = Monitor {
            pid,
            req,
            tasks_path: self.config.tasks_path.clone(),
            max_log_string_len: self.config.max_log_string_len,
            history: self.history.clone(),
            stdin: stdin_tx,
            events: events_tx,
            started: false,
            finished: false,
        };
        let children = Arc::clone(&self.children);
        tokio::spawn(monitor.run(child, stdout, kill, children));

        Ok(handle)
    }

    async fn prepare_log_file(&self, task: &str) -> Result<PathBuf, RunnerError> {
        let dir = &self.config.task_log_dir;
        create_log_dir(dir)
            .await
            .map_err(|source| RunnerError::LogDir {
                path: dir.clone(),
                source,
            })?;
        let path = dir.join(log_file_name(task));
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| RunnerError::LogFile {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// History snapshots, optionally filtered by status.
    pub async fn history(&self, status: Option<ChildStatus>) -> Vec<HistoryEntry> {
        self.history.list(status).await
    }

    pub async fn history_entry(&self, pid: u32) -> Option<HistoryEntry> {
        self.history.get(pid).await
    }

    /// Number of live children.
    pub async fn active_count(&self) -> usize {
        self.children.read().await.len()
    }

    /// Kill the child with `pid`. Returns `false` when it is not running.
    pub async fn kill(&self, pid: u32) -> bool {
        match self.children.read().await.get(&pid) {
            Some(kill) => {
                kill.notify_one();
                true
            }
            None => false,
        }
    }

    /// Kill every live child.
    pub async fn reap_all(&self) {
        let children = self.children.read().await;
        if !children.is_empty() {
            info!(count = children.len(), "Reaping worker processes");
        }
        for kill in children.values() {
            kill.notify_one();
        }
    }
}

/// `<YYYYMMDDTHHMMSSZ>-<task>.log`
fn log_file_name(task: &str) -> String {
    let task: String = task
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}-{task}.log", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

#[cfg(unix)]
async fn create_log_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .await
}

#[cfg(not(unix))]
async fn create_log_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

fn take_pipes(
    child: &mut Child,
    task: &str,
) -> Result<(ChildStdin, ChildStdout, ChildStderr), RunnerError> {
    let missing = |stream| RunnerError::MissingPipe {
        task: task.to_string(),
        stream,
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdin, stdout, stderr))
}

async fn write_stdin(pid: u32, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<ParentMessage>) {
    while let Some(msg) = rx.recv().await {
        let line = match encode_line(&msg) {
            Ok(line) => line,
            Err(e) => {
                error!(pid, error = %e, "Failed to encode parent message");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(format!("{line}\n").as_bytes()).await {
            debug!(pid, error = %e, "Worker stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(pid, error = %e, "Failed to flush worker stdin");
            break;
        }
    }
}

async fn read_stderr(pid: u32, task: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(pid, task = %task, "worker stderr: {}", line);
    }
}

/// Per-child state machine driven by the worker's stdout.
struct Monitor {
    pid: u32,
    req: TaskRequest,
    tasks_path: PathBuf,
    max_log_string_len: usize,
    history: TaskHistory,
    stdin: mpsc::UnboundedSender<ParentMessage>,
    events: mpsc::UnboundedSender<ChildEvent>,
    started: bool,
    finished: bool,
}

impl Monitor {
    async fn run(
        mut self,
        mut child: Child,
        stdout: ChildStdout,
        kill: Arc<Notify>,
        children: KillSwitches,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut killing = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if self.handle_line(&line).await && !killing {
                            killing = true;
                            if let Err(e) = child.start_kill() {
                                debug!(pid = self.pid, error = %e, "Worker already gone");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pid = self.pid, error = %e, "Failed to read worker stdout");
                        break;
                    }
                },
                () = kill.notified(), if !killing => {
                    info!(pid = self.pid, task = %self.req.task, "Killing worker");
                    killing = true;
                    if let Err(e) = child.start_kill() {
                        debug!(pid = self.pid, error = %e, "Worker already gone");
                    }
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.notified() => {
                if let Err(e) = child.start_kill() {
                    debug!(pid = self.pid, error = %e, "Worker already gone");
                }
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to wait for worker");
                None
            }
        };
        debug!(pid = self.pid, ?code, "Worker exited");
        children.write().await.remove(&self.pid);

        if !self.finished {
            self.exited_without_finish(code).await;
        }
    }

    /// Handle one stdout line. Returns `true` when the child should be
    /// killed.
    async fn handle_line(&mut self, line: &str) -> bool {
        match decode_worker_line(line) {
            Ok(Inbound::Known(msg)) => self.handle_message(msg).await,
            Ok(Inbound::Unknown { kind, .. }) => {
                warn!(pid = self.pid, kind = %kind, "Unknown message type from worker");
                false
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Malformed message from worker");
                false
            }
        }
    }

    async fn handle_message(&mut self, msg: WorkerMessage) -> bool {
        if self.finished {
            trace!(pid = self.pid, "Ignoring worker message after finish");
            return false;
        }
        match msg {
            WorkerMessage::Ready => {
                self.send_start();
                false
            }
            WorkerMessage::Event { name, event } => {
                let event = TaskEvent::new(name, event);
                let finish = event.is_finish();
                self.record_event(event, ChildStatus::Finished).await;
                finish
            }
            WorkerMessage::Subtask {
                id,
                resource,
                task,
                msg,
            } => {
                debug!(pid = self.pid, subtask_id = %id, %resource, %task, "Subtask requested");
                self.record("subtask", json!({
                    "id": id,
                    "resource": resource,
                    "task": task,
                    "msg": msg,
                }))
                .await;
                self.forward(ChildEvent::Subtask(SubtaskRequest {
                    id,
                    resource,
                    task,
                    msg,
                }));
                false
            }
            WorkerMessage::Log { entry } => {
                self.record_log(entry).await;
                false
            }
            WorkerMessage::Exception { error } => {
                error!(
                    pid = self.pid,
                    task = %self.req.task,
                    stack = error.stack.as_deref().unwrap_or_default(),
                    "Worker exception: {}",
                    error.message
                );
                self.record("exception", json!(error)).await;
                false
            }
        }
    }

    fn send_start(&mut self) {
        if self.started {
            warn!(pid = self.pid, "Worker reported ready twice");
            return;
        }
        self.started = true;
        debug!(pid = self.pid, task = %self.req.task, "Worker ready, sending start");
        let start = ParentMessage::Start {
            req: self.req.clone(),
            tasks_path: self.tasks_path.clone(),
        };
        if self.stdin.send(start).is_err() {
            warn!(pid = self.pid, "Worker stdin closed before start");
        }
    }

    async fn record(&self, kind: &str, message: Value) {
        let recorded = RecordedMessage {
            kind: kind.to_string(),
            message,
        };
        self.history
            .update(self.pid, |entry| entry.messages.push(recorded))
            .await;
    }

    /// Record `event` in the history and forward it. A `finish` moves the
    /// entry to `terminal` in the same update.
    async fn record_event(&mut self, event: TaskEvent, terminal: ChildStatus) {
        debug!(
            pid = self.pid,
            task = %self.req.task,
            event = %event.name,
            payload = %truncate_strings(&event.payload, self.max_log_string_len),
            "Task event"
        );

        let is_error = event.is_error();
        let is_finish = event.is_finish();
        if is_finish {
            self.finished = true;
        }
        let recorded = RecordedMessage {
            kind: "event".to_string(),
            message: json!({ "name": event.name, "event": event.payload }),
        };
        self.history
            .update(self.pid, |entry| {
                entry.messages.push(recorded);
                if is_error {
                    entry.error_count += 1;
                }
                if is_finish {
                    entry.status = terminal;
                    entry.finished_at = Some(Utc::now());
                }
            })
            .await;

        if is_finish {
            info!(pid = self.pid, task = %self.req.task, task_id = %self.req.task_id, "Task finished");
        }
        self.forward(ChildEvent::Event(event));
    }

    async fn record_log(&self, entry: LogEntry) {
        let entry = self.truncated(entry);
        let summary = entry.summary();
        let pid = self.pid;
        match entry.level() {
            LogLevel::Trace => trace!(task = %self.req.task, "pid:{pid} - {summary}"),
            LogLevel::Debug => debug!(task = %self.req.task, "pid:{pid} - {summary}"),
            LogLevel::Info => info!(task = %self.req.task, "pid:{pid} - {summary}"),
            LogLevel::Warn => warn!(task = %self.req.task, "pid:{pid} - {summary}"),
            LogLevel::Error => error!(task = %self.req.task, "pid:{pid} - {summary}"),
        }
        self.history
            .update(self.pid, |history| history.log.push(entry))
            .await;
    }

    fn truncated(&self, entry: LogEntry) -> LogEntry {
        let max = self.max_log_string_len;
        match entry {
            LogEntry::Message {
                timestamp,
                level,
                message,
            } => LogEntry::Message {
                timestamp,
                level,
                message: truncate_strings(&message, max),
            },
            LogEntry::Process {
                timestamp,
                level,
                process,
                args,
                env,
                exitstatus,
                stdout,
                stderr,
            } => LogEntry::Process {
                timestamp,
                level,
                process: truncate_str(&process, max).to_string(),
                args: args
                    .iter()
                    .map(|arg| truncate_str(arg, max).to_string())
                    .collect(),
                env: env
                    .into_iter()
                    .map(|(key, value)| {
                        let value = truncate_str(&value, max).to_string();
                        (key, value)
                    })
                    .collect(),
                exitstatus,
                stdout: truncate_str(&stdout, max).to_string(),
                stderr: truncate_str(&stderr, max).to_string(),
            },
        }
    }

    async fn exited_without_finish(&mut self, code: Option<i32>) {
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let message = format!(
            "Child task process {} did not terminate cleanly. ({code})",
            self.req.task
        );
        error!(pid = self.pid, task = %self.req.task, "{}", message);

        self.record_event(
            TaskEvent::new(EVENT_ERROR, json!({ "error": message })),
            ChildStatus::Failed,
        )
        .await;
        self.record_event(TaskEvent::new(EVENT_FINISH, json!({})), ChildStatus::Failed)
            .await;
    }

    fn forward(&self, event: ChildEvent) {
        if self.events.send(event).is_err() {
            trace!(pid = self.pid, "Child handle dropped, event not forwarded");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name_is_timestamped() {
        let name = log_file_name("demo");
        assert!(name.ends_with("Z-demo.log"), "{name}");
        assert_eq!(name.len(), "YYYYMMDDTHHMMSSZ-demo.log".len());
        assert_eq!(&name[8..9], "T");
    }

    #[test]
    fn log_file_name_flattens_separators() {
        assert!(log_file_name("a/b").ends_with("-a_b.log"));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ChildProcessRunner::new(RunnerConfig::new(
            dir.path().join("missing-worker"),
            dir.path().to_path_buf(),
            dir.path().join("logs"),
        ));
        let err = runner
            .dispatch(TaskRequest::from_body("demo", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert!(dir.path().join("logs").is_dir());
        assert_eq!(runner.active_count().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_exit_without_finish_is_synthesized() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("worker.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"type\":\"ready\"}'\nread line\necho '{\"type\":\"event\",\"name\":\"start\",\"event\":{}}'\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ChildProcessRunner::new(RunnerConfig::new(
            script,
            dir.path().to_path_buf(),
            dir.path().join("logs"),
        ));
        let mut child = runner
            .dispatch(TaskRequest::from_body("flaky", json!({"task_id": "t9"})))
            .await
            .unwrap();
        assert_eq!(child.task_id(), "t9");

        let mut names = Vec::new();
        let mut error = Value::Null;
        let mut status_at_finish = None;
        while let Some(event) = child.next().await {
            if let ChildEvent::Event(event) = event {
                if event.is_error() {
                    error = event.payload.clone();
                }
                if event.is_finish() {
                    let entry = runner.history_entry(child.pid()).await.unwrap();
                    status_at_finish = Some(entry.status);
                }
                names.push(event.name);
            }
        }
        assert_eq!(status_at_finish, Some(ChildStatus::Failed));
        assert_eq!(names, vec!["start", "error", "finish"]);
        assert_eq!(
            error["error"],
            "Child task process flaky did not terminate cleanly. (3)"
        );

        let entry = runner.history_entry(child.pid()).await.unwrap();
        assert_eq!(entry.status, ChildStatus::Failed);
        assert_eq!(entry.error_count, 1);
        assert_eq!(entry.messages.len(), 3);
        assert!(entry.finished_at.is_some());
    }
}
