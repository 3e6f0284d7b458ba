//! Bounded record of every task the runner has executed.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskagent_core::LogEntry;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Active,
    Finished,
    Failed,
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Failed => "failed",
        })
    }
}

impl FromStr for ChildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Unknown task status: {other}")),
        }
    }
}

/// One recorded message from a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: Value,
}

/// Per-child history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub pid: u32,
    pub task: String,
    pub task_id: String,
    pub params: Map<String, Value>,
    pub status: ChildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub messages: Vec<RecordedMessage>,
    pub log: Vec<LogEntry>,
    /// Seconds between start and finish (or now, while active). Filled in
    /// on snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
}

impl HistoryEntry {
    pub fn new(pid: u32, task: &str, task_id: &str, params: Map<String, Value>) -> Self {
        Self {
            pid,
            task: task.to_string(),
            task_id: task_id.to_string(),
            params,
            status: ChildStatus::Active,
            started_at: Utc::now(),
            finished_at: None,
            error_count: 0,
            messages: Vec::new(),
            log: Vec::new(),
            elapsed_seconds: None,
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> Self {
        let end = self.finished_at.unwrap_or(now);
        Self {
            elapsed_seconds: Some((end - self.started_at).num_seconds()),
            ..self.clone()
        }
    }
}

/// Shared, bounded history of child executions, oldest first.
#[derive(Clone)]
pub struct TaskHistory {
    entries: Arc<RwLock<VecDeque<HistoryEntry>>>,
    max_entries: usize,
}

impl TaskHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries: max_entries.max(1),
        }
    }

    /// Append a new entry, evicting the oldest finished ones past the bound.
    pub async fn insert(&self, entry: HistoryEntry) {
        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            match entries.iter().position(|e| e.status != ChildStatus::Active) {
                Some(idx) => {
                    entries.remove(idx);
                }
                None => break,
            }
        }
    }

    /// Apply `f` to the entry for `pid`. Returns `false` when it is gone.
    pub async fn update(&self, pid: u32, f: impl FnOnce(&mut HistoryEntry)) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().rev().find(|e| e.pid == pid) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, pid: u32) -> Option<HistoryEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .find(|e| e.pid == pid)
            .map(|e| e.snapshot(Utc::now()))
    }

    /// Snapshots of every entry, optionally filtered by status.
    pub async fn list(&self, status: Option<ChildStatus>) -> Vec<HistoryEntry> {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| e.snapshot(now))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(pid: u32) -> HistoryEntry {
        HistoryEntry::new(pid, "demo", "t", Map::new())
    }

    #[tokio::test]
    async fn filters_by_status() {
        let history = TaskHistory::new(10);
        history.insert(entry(1)).await;
        history.insert(entry(2)).await;
        history
            .update(2, |e| e.status = ChildStatus::Finished)
            .await;

        assert_eq!(history.list(None).await.len(), 2);
        let finished = history.list(Some(ChildStatus::Finished)).await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].pid, 2);
        assert!(finished[0].elapsed_seconds.is_some());
    }

    #[tokio::test]
    async fn evicts_oldest_completed_entries() {
        let history = TaskHistory::new(2);
        history.insert(entry(1)).await;
        history.insert(entry(2)).await;
        history.update(2, |e| e.status = ChildStatus::Failed).await;
        history.insert(entry(3)).await;

        let pids: Vec<u32> = history.list(None).await.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![1, 3]);
    }

    #[tokio::test]
    async fn update_of_unknown_pid_reports_false() {
        let history = TaskHistory::new(2);
        assert!(!history.update(9, |e| e.error_count += 1).await);
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!("failed".parse::<ChildStatus>(), Ok(ChildStatus::Failed));
        assert_eq!(ChildStatus::Active.to_string(), "active");
        assert!("done".parse::<ChildStatus>().is_err());
    }
}
