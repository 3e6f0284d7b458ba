//! Caller side of the task protocol.
//!
//! A [`CommandClient`] hands out one cached [`AgentHandle`] per agent
//! instance. Handles submit tasks and demultiplex the events coming back.

pub mod handle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use taskagent_core::RoutingKey;
use taskagent_core::config::ClientConfig;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub use handle::{AgentHandle, CallEvent, TaskHandle};

use crate::transport::{QueueSpec, Transport, TransportError};

/// Default time a call may wait for `finish`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub timeout: Duration,
    /// Cap on calls awaiting `finish` per handle.
    pub max_outstanding: Option<usize>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_outstanding: None,
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_outstanding: config.max_outstanding,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Agent {uuid} already has {max} outstanding calls")]
    AdmissionOverflow { uuid: String, max: usize },

    #[error("Call {task_id} timed out")]
    Timeout { task_id: String },

    #[error("Call {task_id} ended without a finish event")]
    Closed { task_id: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Factory and cache of agent handles sharing one transport.
pub struct CommandClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    handles: RwLock<HashMap<(String, String), Arc<AgentHandle>>>,
}

impl CommandClient {
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub const fn options(&self) -> ClientOptions {
        self.options
    }

    /// Handle for the agent `resource`/`uuid`, created on first use.
    pub async fn get_agent_handle(
        &self,
        resource: &str,
        uuid: &str,
    ) -> Result<Arc<AgentHandle>, ClientError> {
        let key = (resource.to_string(), uuid.to_string());
        if let Some(handle) = self.handles.read().await.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(AgentHandle::connect(
            Arc::clone(&self.transport),
            resource,
            uuid,
            self.options,
        )?);
        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Probe an agent's liveness. Resolves to the agent's reply body.
    pub async fn ping(&self, resource: &str, uuid: &str) -> Result<Value, ClientError> {
        let client_id = Uuid::new_v4().to_string();
        let req_id = Uuid::new_v4().to_string();
        let reply_key = RoutingKey::PingReply {
            resource: resource.to_string(),
            client_id: client_id.clone(),
            uuid: uuid.to_string(),
        };
        let mut replies = self.transport.subscribe(QueueSpec::new(
            format!("{resource}.ack.{client_id}"),
            vec![reply_key.to_string()],
        ))?;

        let probe = RoutingKey::Ping {
            resource: resource.to_string(),
            uuid: uuid.to_string(),
        };
        debug!(routing_key = %probe, req_id = %req_id, "Pinging agent");
        self.transport.publish(
            &probe.to_string(),
            json!({ "req_id": req_id, "client_id": client_id }),
        )?;

        let wait = async {
            while let Some(delivery) = replies.recv().await {
                if delivery.body["req_id"] == req_id.as_str() {
                    return Some(delivery.body);
                }
            }
            None
        };
        match tokio::time::timeout(self.options.timeout, wait).await {
            Ok(Some(body)) => Ok(body),
            Ok(None) => Err(ClientError::Closed { task_id: req_id }),
            Err(_) => Err(ClientError::Timeout { task_id: req_id }),
        }
    }
}
