//! Structured task log.
//!
//! Every entry is kept for the `finish` payload, written to the worker's own
//! tracing output and forwarded to the parent as a `log` message.

use std::collections::BTreeMap;

use serde_json::Value;
use taskagent_core::ipc::WorkerMessage;
use taskagent_core::model::now_iso;
use taskagent_core::{LogEntry, LogLevel};
use tracing::{debug, error, info, trace, warn};

use crate::{Outbound, emit};

pub struct TaskLog {
    entries: Vec<LogEntry>,
    outbound: Outbound,
}

impl TaskLog {
    pub(crate) const fn new(outbound: Outbound) -> Self {
        Self {
            entries: Vec::new(),
            outbound,
        }
    }

    pub fn trace(&mut self, message: impl Into<Value>) {
        self.message(LogLevel::Trace, message);
    }

    pub fn debug(&mut self, message: impl Into<Value>) {
        self.message(LogLevel::Debug, message);
    }

    pub fn info(&mut self, message: impl Into<Value>) {
        self.message(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<Value>) {
        self.message(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<Value>) {
        self.message(LogLevel::Error, message);
    }

    /// Record a leveled message.
    pub fn message(&mut self, level: LogLevel, message: impl Into<Value>) {
        self.record(LogEntry::message(level, message));
    }

    /// Record one finished subprocess execution.
    pub fn process(
        &mut self,
        bin: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        exitstatus: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) {
        self.record(LogEntry::Process {
            timestamp: now_iso(),
            level: LogLevel::Debug,
            process: bin.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            exitstatus,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    /// Entries recorded so far, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn record(&mut self, entry: LogEntry) {
        let summary = entry.summary();
        match entry.level() {
            LogLevel::Trace => trace!("{summary}"),
            LogLevel::Debug => debug!("{summary}"),
            LogLevel::Info => info!("{summary}"),
            LogLevel::Warn => warn!("{summary}"),
            LogLevel::Error => error!("{summary}"),
        }
        emit(
            &self.outbound,
            WorkerMessage::Log {
                entry: entry.clone(),
            },
        );
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn entries_are_kept_and_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut log = TaskLog::new(tx);
        log.info("first");
        log.process(
            "/bin/true",
            &["-x".to_string()],
            &BTreeMap::new(),
            Some(0),
            "",
            "",
        );

        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.entries()[0].level(), LogLevel::Info);
        assert_eq!(log.entries()[1].level(), LogLevel::Debug);

        let forwarded = rx.try_recv();
        assert!(matches!(
            forwarded,
            Ok(WorkerMessage::Log { entry: LogEntry::Message { .. } })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerMessage::Log { entry: LogEntry::Process { .. } })
        ));
    }

    #[test]
    fn closed_channel_still_records() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut log = TaskLog::new(tx);
        log.warn(serde_json::json!({"code": 7}));
        assert_eq!(log.entries().len(), 1);
    }
}
