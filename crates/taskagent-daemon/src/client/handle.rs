//! Per-agent call handle: correlation, timeouts and event demultiplexing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use taskagent_core::model::{FIELD_CLIENT_ID, FIELD_TASK_ID};
use taskagent_core::routing::event_pattern;
use taskagent_core::{RoutingKey, TaskEvent};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClientError, ClientOptions};
use crate::transport::{QueueSpec, Subscription, Transport};

/// One item of a call's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Event(TaskEvent),
    /// No terminal event arrived within the handle's timeout. Nothing else
    /// follows.
    TimedOut,
}

struct PendingCall {
    tx: mpsc::UnboundedSender<CallEvent>,
    timer: JoinHandle<()>,
}

type PendingCalls = Arc<RwLock<HashMap<String, PendingCall>>>;

/// Caller-side stream of one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    rx: mpsc::UnboundedReceiver<CallEvent>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next event. `None` after `finish` or `TimedOut` was delivered.
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.rx.recv().await
    }

    /// Wait for the terminal `finish` event, skipping everything before it.
    pub async fn finished(mut self) -> Result<TaskEvent, ClientError> {
        while let Some(event) = self.rx.recv().await {
            match event {
                CallEvent::Event(event) if event.is_finish() => return Ok(event),
                CallEvent::Event(_) => {}
                CallEvent::TimedOut => {
                    return Err(ClientError::Timeout {
                        task_id: self.task_id,
                    });
                }
            }
        }
        Err(ClientError::Closed {
            task_id: self.task_id,
        })
    }
}

/// Handle addressing one agent instance (`resource`/`uuid`).
///
/// Every handle has its own client id and one subscription receiving all
/// events addressed to it; events are routed to calls by task id.
pub struct AgentHandle {
    resource: String,
    uuid: String,
    client_id: String,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    pending: PendingCalls,
    demux: JoinHandle<()>,
}

impl AgentHandle {
    pub fn connect(
        transport: Arc<dyn Transport>,
        resource: &str,
        uuid: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client_id = Uuid::new_v4().to_string();
        let subscription = transport.subscribe(QueueSpec::new(
            format!("{resource}.{uuid}.client.{client_id}"),
            vec![event_pattern(resource, uuid, &client_id)],
        ))?;
        let pending: PendingCalls = Arc::default();
        let demux = tokio::spawn(demux(subscription, Arc::clone(&pending)));
        debug!(resource, uuid, client_id = %client_id, "Agent handle connected");

        Ok(Self {
            resource: resource.to_string(),
            uuid: uuid.to_string(),
            client_id,
            transport,
            options,
            pending,
            demux,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub const fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Calls still waiting for `finish`.
    pub async fn outstanding(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Submit `task` with `params` to the agent.
    ///
    /// The request body is `params` stamped with a fresh `task_id` and this
    /// handle's `client_id`. The call is registered before publishing so no
    /// event can arrive ahead of it.
    pub async fn send_task(&self, task: &str, params: Value) -> Result<TaskHandle, ClientError> {
        let task_id = Uuid::new_v4().to_string();
        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        body.insert(FIELD_TASK_ID.to_string(), Value::String(task_id.clone()));
        body.insert(
            FIELD_CLIENT_ID.to_string(),
            Value::String(self.client_id.clone()),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = self.pending.write().await;
            if let Some(max) = self.options.max_outstanding
                && pending.len() >= max
            {
                warn!(uuid = %self.uuid, max, task, "Too many outstanding calls");
                return Err(ClientError::AdmissionOverflow {
                    uuid: self.uuid.clone(),
                    max,
                });
            }
            let timer = tokio::spawn(expire(
                Arc::clone(&self.pending),
                task_id.clone(),
                self.options.timeout,
            ));
            pending.insert(task_id.clone(), PendingCall { tx, timer });
        }

        let key = RoutingKey::task(&self.resource, &self.uuid, task).to_string();
        debug!(routing_key = %key, task_id = %task_id, "Sending task");
        if let Err(e) = self.transport.publish(&key, Value::Object(body)) {
            if let Some(call) = self.pending.write().await.remove(&task_id) {
                call.timer.abort();
            }
            return Err(e.into());
        }

        Ok(TaskHandle { task_id, rx })
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.demux.abort();
        if let Ok(mut pending) = self.pending.try_write() {
            for (_, call) in pending.drain() {
                call.timer.abort();
            }
        }
    }
}

async fn expire(pending: PendingCalls, task_id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let call = pending.write().await.remove(&task_id);
    if let Some(call) = call {
        warn!(task_id = %task_id, timeout_ms = timeout.as_millis(), "Task call timed out");
        if call.tx.send(CallEvent::TimedOut).is_err() {
            debug!(task_id = %task_id, "Caller dropped before timeout");
        }
    }
}

async fn demux(mut subscription: Subscription, pending: PendingCalls) {
    while let Some(delivery) = subscription.recv().await {
        let (name, task_id) = match delivery.routing_key.parse::<RoutingKey>() {
            Ok(RoutingKey::Event { event, task_id, .. }) => (event, task_id),
            _ => {
                debug!(routing_key = %delivery.routing_key, "Not a task event, ignoring");
                continue;
            }
        };
        let event = TaskEvent::new(name, delivery.body);
        let finish = event.is_finish();

        let mut pending = pending.write().await;
        let Some(call) = pending.get(&task_id) else {
            debug!(task_id = %task_id, event = %event.name, "Event for unknown or expired call");
            continue;
        };
        if call.tx.send(CallEvent::Event(event)).is_err() {
            debug!(task_id = %task_id, "Caller dropped its task handle");
        }
        if finish && let Some(call) = pending.remove(&task_id) {
            call.timer.abort();
        }
    }
    debug!(queue = %subscription.queue(), "Event subscription closed");
}
