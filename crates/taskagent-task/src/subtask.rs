//! Delegated subtask bookkeeping inside the worker.
//!
//! [`TaskContext::sub_task`](crate::TaskContext::sub_task) registers a fresh
//! id here and the IPC reader routes every `subtask` reply for that id to the
//! matching [`SubtaskHandle`]. Registrations survive multiple events; the
//! task unregisters after the terminal one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use taskagent_core::model::EVENT_FINISH;
use tokio::sync::mpsc;

use crate::error::TaskError;

/// One event of a delegated task.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskEvent {
    pub name: String,
    pub payload: Value,
}

impl SubtaskEvent {
    pub fn is_finish(&self) -> bool {
        self.name == EVENT_FINISH
    }
}

type Senders = HashMap<String, mpsc::UnboundedSender<SubtaskEvent>>;

/// Shared map of live subtask ids.
#[derive(Debug, Clone, Default)]
pub struct SubtaskRegistry {
    inner: Arc<Mutex<Senders>>,
}

impl SubtaskRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Senders> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: &str) -> SubtaskHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id.to_string(), tx);
        SubtaskHandle {
            id: id.to_string(),
            rx,
            registry: self.clone(),
        }
    }

    /// Deliver an event to the subtask registered under `id`.
    ///
    /// Returns `false` when no live registration exists; the event is
    /// dropped.
    pub fn dispatch(&self, id: &str, name: &str, payload: Value) -> bool {
        let event = SubtaskEvent {
            name: name.to_string(),
            payload,
        };
        let mut senders = self.lock();
        match senders.get(id).map(|tx| tx.send(event).is_ok()) {
            Some(true) => true,
            Some(false) => {
                senders.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn unregister(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of one delegation.
#[derive(Debug)]
pub struct SubtaskHandle {
    id: String,
    rx: mpsc::UnboundedReceiver<SubtaskEvent>,
    registry: SubtaskRegistry,
}

impl SubtaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event relayed for this subtask.
    pub async fn next(&mut self) -> Option<SubtaskEvent> {
        self.rx.recv().await
    }

    /// Wait for the terminal event, unregister, and return its payload.
    /// Intermediate events are skipped.
    pub async fn finished(mut self) -> Result<Value, TaskError> {
        while let Some(event) = self.next().await {
            if event.is_finish() {
                self.registry.unregister(&self.id);
                return Ok(event.payload);
            }
        }
        Err(TaskError::SubtaskClosed(self.id))
    }

    pub fn unregister(&self) {
        self.registry.unregister(&self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registration_survives_multiple_events() {
        let registry = SubtaskRegistry::default();
        let mut handle = registry.register("s1");

        assert!(registry.dispatch("s1", "progress", json!({"value": 10})));
        assert!(registry.dispatch("s1", "finish", json!({"ok": true})));
        assert_eq!(registry.len(), 1);

        assert_eq!(handle.next().await.unwrap().name, "progress");
        assert_eq!(handle.finished().await.unwrap(), json!({"ok": true}));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_id_is_dropped() {
        let registry = SubtaskRegistry::default();
        assert!(!registry.dispatch("nope", "finish", json!({})));
    }

    #[test]
    fn dropped_handle_is_pruned_on_dispatch() {
        let registry = SubtaskRegistry::default();
        drop(registry.register("s2"));
        assert!(!registry.dispatch("s2", "progress", json!({})));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn events_reach_only_their_own_handle() {
        let registry = SubtaskRegistry::default();
        let mut a = registry.register("a");
        let mut b = registry.register("b");
        registry.dispatch("b", "progress", json!({"value": 1}));
        registry.dispatch("a", "finish", json!({}));
        assert!(a.next().await.unwrap().is_finish());
        assert_eq!(b.next().await.unwrap().name, "progress");
    }
}
