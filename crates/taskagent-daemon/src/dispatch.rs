//! Subtask delegation.
//!
//! When a worker asks for a subtask, the agent submits it to the local
//! instance of the target resource type (same uuid, different resource) and
//! streams every event back into the requesting worker, tagged with the
//! subtask id the worker generated.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskagent_core::TaskEvent;
use taskagent_core::model::{EVENT_ERROR, EVENT_FINISH};
use tracing::{debug, info, warn};

use crate::client::{AgentHandle, CallEvent, ClientError, ClientOptions, CommandClient};
use crate::runner::{ChildEvent, ChildHandle, SubtaskRequest, WorkerSender};
use crate::transport::Transport;

/// Default time a delegated subtask may run.
pub const DELEGATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Routes subtask requests from local workers to sibling agents.
pub struct SubtaskDispatcher {
    client: CommandClient,
    uuid: String,
}

impl SubtaskDispatcher {
    pub fn new(transport: Arc<dyn Transport>, uuid: &str, timeout: Duration) -> Self {
        let options = ClientOptions {
            timeout,
            max_outstanding: None,
        };
        Self {
            client: CommandClient::new(transport, options),
            uuid: uuid.to_string(),
        }
    }

    /// Handle on the agent serving `resource` under this agent's uuid.
    pub async fn local_agent_handle(&self, resource: &str) -> Result<Arc<AgentHandle>, ClientError> {
        self.client.get_agent_handle(resource, &self.uuid).await
    }

    /// Submit `req` and relay its events into `worker` in the background.
    pub async fn delegate(&self, req: SubtaskRequest, worker: WorkerSender) -> Result<(), ClientError> {
        let handle = self.local_agent_handle(&req.resource).await?;
        let mut call = handle.send_task(&req.task, req.msg).await?;
        info!(
            subtask_id = %req.id,
            resource = %req.resource,
            task = %req.task,
            task_id = %call.task_id(),
            pid = worker.pid(),
            "Subtask delegated"
        );

        let id = req.id;
        tokio::spawn(async move {
            while let Some(event) = call.next().await {
                match event {
                    CallEvent::Event(event) => {
                        let finish = event.is_finish();
                        if !worker.send_subtask(&id, &event.name, event.payload) {
                            debug!(subtask_id = %id, "Worker gone, dropping subtask events");
                            break;
                        }
                        if finish {
                            break;
                        }
                    }
                    CallEvent::TimedOut => {
                        relay_failure(&worker, &id, "Subtask timed out");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Drain `child`, handing lifecycle events to `on_event` and serving its
    /// subtask requests. Returns once the child is gone.
    pub async fn pump<F>(&self, mut child: ChildHandle, mut on_event: F)
    where
        F: FnMut(TaskEvent) + Send,
    {
        let worker = child.sender();
        while let Some(event) = child.next().await {
            match event {
                ChildEvent::Event(event) => on_event(event),
                ChildEvent::Subtask(req) => {
                    let id = req.id.clone();
                    if let Err(e) = self.delegate(req, worker.clone()).await {
                        warn!(subtask_id = %id, error = %e, "Subtask delegation failed");
                        relay_failure(&worker, &id, &e.to_string());
                    }
                }
            }
        }
    }
}

/// Terminate a subtask from the worker's point of view.
fn relay_failure(worker: &WorkerSender, id: &str, message: &str) {
    let delivered = worker.send_subtask(id, EVENT_ERROR, json!({ "error": message }))
        && worker.send_subtask(id, EVENT_FINISH, json!({}));
    if !delivered {
        debug!(subtask_id = %id, "Worker gone, subtask failure not relayed");
    }
}
