//! The task agent: binds admission queues, runs every admitted request in a
//! worker process and publishes the resulting events back to the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use taskagent_core::config::{Config, QueueConfig};
use taskagent_core::model::{EVENT_ERROR, EVENT_FINISH, now_iso};
use taskagent_core::routing::task_pattern;
use taskagent_core::{RoutingKey, TaskEvent, TaskRequest};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionQueue, DeliveryHandler};
use crate::client::{AgentHandle, ClientError};
use crate::dispatch::SubtaskDispatcher;
use crate::runner::{ChildProcessRunner, ChildStatus, RunnerConfig};
use crate::transport::{Delivery, QueueSpec, Transport, TransportError};

/// Queue answering history queries.
pub const MANAGEMENT_QUEUE: &str = "task_management";
/// Task name served by the management queue.
pub const SHOW_TASKS: &str = "show_tasks";
const MANAGEMENT_CONCURRENCY: usize = 8;

/// Worker binary looked up next to the running executable.
pub const WORKER_BIN_NAME: &str = "taskagent-worker";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Cannot locate the worker binary: {0}")]
    WorkerBin(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Publishes one request's events to `<r>.<u>.event.<name>.<clientId>.<taskId>`.
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn Transport>,
    resource: String,
    uuid: String,
    client_id: String,
    task_id: String,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn Transport>, resource: &str, uuid: &str, req: &TaskRequest) -> Self {
        Self {
            transport,
            resource: resource.to_string(),
            uuid: uuid.to_string(),
            client_id: req.client_id.clone(),
            task_id: req.task_id.clone(),
        }
    }

    pub fn publish(&self, event: &TaskEvent) {
        let key = RoutingKey::event(
            &self.resource,
            &self.uuid,
            &event.name,
            &self.client_id,
            &self.task_id,
        );
        if let Err(e) = self.transport.publish(&key.to_string(), event.payload.clone()) {
            warn!(routing_key = %key, error = %e, "Failed to publish task event");
        }
    }

    fn fail(&self, message: &str) {
        self.publish(&TaskEvent::new(EVENT_ERROR, json!({ "error": message })));
        self.publish(&TaskEvent::new(EVENT_FINISH, json!({})));
    }
}

/// A running agent instance identified by `resource`/`uuid`.
pub struct TaskAgent {
    resource: String,
    uuid: String,
    transport: Arc<dyn Transport>,
    runner: ChildProcessRunner,
    dispatcher: Arc<SubtaskDispatcher>,
    queues: Mutex<Vec<AdmissionQueue>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskAgent {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, AgentError> {
        let agent = &config.agent;
        let uuid = agent
            .uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let worker_bin = match &agent.worker_bin {
            Some(bin) => bin.clone(),
            None => default_worker_bin().map_err(AgentError::WorkerBin)?,
        };
        let runner = ChildProcessRunner::new(RunnerConfig::from_agent_config(agent, worker_bin));
        let dispatcher = Arc::new(SubtaskDispatcher::new(
            Arc::clone(&transport),
            &uuid,
            Duration::from_secs(agent.delegation_timeout_secs),
        ));
        info!(resource = %agent.resource, uuid = %uuid, "Task agent created");

        Ok(Self {
            resource: agent.resource.clone(),
            uuid,
            transport,
            runner,
            dispatcher,
            queues: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub const fn runner(&self) -> &ChildProcessRunner {
        &self.runner
    }

    pub fn dispatcher(&self) -> Arc<SubtaskDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Handle on the sibling agent serving `resource` under this uuid.
    pub async fn local_agent_handle(&self, resource: &str) -> Result<Arc<AgentHandle>, ClientError> {
        self.dispatcher.local_agent_handle(resource).await
    }

    /// Bind the management and ping queues plus every queue in `defs`.
    pub async fn setup_queues(&self, defs: &[QueueConfig]) -> Result<(), AgentError> {
        self.bind_management_queue().await?;
        self.bind_ping_queue().await?;
        self.use_queues(defs).await
    }

    /// Bind one admission queue per definition, routing each listed task
    /// into a worker process.
    pub async fn use_queues(&self, defs: &[QueueConfig]) -> Result<(), AgentError> {
        for def in defs {
            let patterns = def
                .tasks
                .iter()
                .map(|task| task_pattern(&self.resource, &self.uuid, task))
                .collect();
            let spec = QueueSpec::new(self.queue_name(&def.name), patterns)
                .with_ttl(def.message_ttl_ms.map(Duration::from_millis));
            let queue = AdmissionQueue::bind(
                self.transport.as_ref(),
                spec,
                def.max_concurrent,
                self.task_handler(),
            )?;
            info!(queue = %queue.name(), tasks = ?def.tasks, "Serving tasks");
            self.queues.lock().await.push(queue);
        }
        Ok(())
    }

    fn queue_name(&self, name: &str) -> String {
        format!("{}.{}.{name}", self.resource, self.uuid)
    }

    fn task_handler(&self) -> DeliveryHandler {
        let runner = self.runner.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let transport = Arc::clone(&self.transport);
        let resource = self.resource.clone();
        let uuid = self.uuid.clone();

        Arc::new(move |delivery, completion| {
            let Some(req) = request_from(&delivery) else {
                completion.complete();
                return;
            };
            let publisher = EventPublisher::new(Arc::clone(&transport), &resource, &uuid, &req);
            let runner = runner.clone();
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                run_request(&runner, &dispatcher, &publisher, req).await;
                completion.complete();
            });
        })
    }

    async fn bind_management_queue(&self) -> Result<(), AgentError> {
        let runner = self.runner.clone();
        let transport = Arc::clone(&self.transport);
        let resource = self.resource.clone();
        let uuid = self.uuid.clone();

        let handler: DeliveryHandler = Arc::new(move |delivery, completion| {
            let Some(req) = request_from(&delivery) else {
                completion.complete();
                return;
            };
            let publisher = EventPublisher::new(Arc::clone(&transport), &resource, &uuid, &req);
            let runner = runner.clone();
            tokio::spawn(async move {
                let status = req
                    .params
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<ChildStatus>().ok());
                let history = runner.history(status).await;
                publisher.publish(&TaskEvent::new(EVENT_FINISH, json!({ "history": history })));
                completion.complete();
            });
        });

        let spec = QueueSpec::new(
            self.queue_name(MANAGEMENT_QUEUE),
            vec![task_pattern(&self.resource, &self.uuid, SHOW_TASKS)],
        );
        let queue = AdmissionQueue::bind(
            self.transport.as_ref(),
            spec,
            MANAGEMENT_CONCURRENCY,
            handler,
        )?;
        self.queues.lock().await.push(queue);
        Ok(())
    }

    async fn bind_ping_queue(&self) -> Result<(), AgentError> {
        let transport = Arc::clone(&self.transport);
        let resource = self.resource.clone();
        let uuid = self.uuid.clone();

        let handler: DeliveryHandler = Arc::new(move |delivery, completion| {
            let body = &delivery.body;
            let Some(client_id) = body.get("client_id").and_then(Value::as_str) else {
                warn!(routing_key = %delivery.routing_key, "Ping without client_id");
                completion.complete();
                return;
            };
            let reply = RoutingKey::PingReply {
                resource: resource.clone(),
                client_id: client_id.to_string(),
                uuid: uuid.clone(),
            };
            let payload = json!({
                "req_id": body.get("req_id").cloned().unwrap_or(Value::Null),
                "timestamp": now_iso(),
            });
            if let Err(e) = transport.publish(&reply.to_string(), payload) {
                warn!(error = %e, "Failed to answer ping");
            }
            completion.complete();
        });

        let probe = RoutingKey::Ping {
            resource: self.resource.clone(),
            uuid: self.uuid.clone(),
        };
        let spec = QueueSpec::new(self.queue_name("ping"), vec![probe.to_string()]);
        let queue = AdmissionQueue::bind(
            self.transport.as_ref(),
            spec,
            MANAGEMENT_CONCURRENCY,
            handler,
        )?;
        self.queues.lock().await.push(queue);
        Ok(())
    }

    /// Publish an empty heartbeat every `interval`.
    pub async fn start_heartbeat(&self, interval: Duration) {
        let transport = Arc::clone(&self.transport);
        let key = RoutingKey::Heartbeat {
            resource: self.resource.clone(),
            uuid: self.uuid.clone(),
        }
        .to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!(routing_key = %key, "Heartbeat");
                if let Err(e) = transport.publish(&key, json!({})) {
                    warn!(error = %e, "Failed to publish heartbeat");
                }
            }
        });
        self.background.lock().await.push(task);
    }

    /// Stop consuming and kill every running worker.
    pub async fn shutdown(&self) {
        info!(resource = %self.resource, uuid = %self.uuid, "Shutting down task agent");
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        self.queues.lock().await.clear();
        self.runner.reap_all().await;
    }
}

/// Recover the request from a task delivery. Requests without a `task_id`
/// and `client_id` have no reply address and are dropped.
fn request_from(delivery: &Delivery) -> Option<TaskRequest> {
    let Ok(RoutingKey::Task { task, .. }) = delivery.routing_key.parse::<RoutingKey>() else {
        warn!(routing_key = %delivery.routing_key, "Not a task request, dropping");
        return None;
    };
    let req = TaskRequest::from_body(task, delivery.body.clone());
    if req.task_id.is_empty() || req.client_id.is_empty() {
        warn!(
            routing_key = %delivery.routing_key,
            task_id = %req.task_id,
            client_id = %req.client_id,
            "Task request without reply address, dropping"
        );
        return None;
    }
    Some(req)
}

async fn run_request(
    runner: &ChildProcessRunner,
    dispatcher: &SubtaskDispatcher,
    publisher: &EventPublisher,
    req: TaskRequest,
) {
    let task = req.task.clone();
    match runner.dispatch(req).await {
        Ok(child) => {
            dispatcher.pump(child, |event| publisher.publish(&event)).await;
        }
        Err(e) => {
            error!(task = %task, error = %e, "Failed to start worker");
            publisher.fail(&e.to_string());
        }
    }
}

fn default_worker_bin() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().map(PathBuf::from).unwrap_or_default();
    Ok(dir.join(format!("{WORKER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::{ClientOptions, CommandClient};
    use crate::transport::MemoryBus;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.agent.resource = "svc".to_string();
        config.agent.uuid = Some("u1".to_string());
        config.agent.worker_bin = Some(dir.join("no-such-worker"));
        config.agent.task_log_dir = dir.join("logs");
        config
    }

    #[test]
    fn uuid_is_generated_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.agent.uuid = None;
        let agent = TaskAgent::new(&config, Arc::new(MemoryBus::new())).unwrap();
        assert!(Uuid::parse_str(agent.uuid()).is_ok());
    }

    #[tokio::test]
    async fn answers_pings() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = TaskAgent::new(&config(dir.path()), bus.clone()).unwrap();
        agent.setup_queues(&[]).await.unwrap();

        let client = CommandClient::new(bus, ClientOptions::default());
        let reply = client.ping("svc", "u1").await.unwrap();
        assert!(reply["timestamp"].is_string());
        assert!(reply["req_id"].is_string());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = TaskAgent::new(&config(dir.path()), bus.clone()).unwrap();
        agent
            .use_queues(&[QueueConfig {
                name: "jobs".to_string(),
                tasks: vec!["demo".to_string()],
                max_concurrent: 1,
                message_ttl_ms: None,
            }])
            .await
            .unwrap();

        let client = CommandClient::new(bus, ClientOptions::default());
        let handle = client.get_agent_handle("svc", "u1").await.unwrap();
        let mut call = handle.send_task("demo", json!({})).await.unwrap();

        let mut names = Vec::new();
        while let Some(crate::client::CallEvent::Event(event)) = call.next().await {
            names.push(event.name);
        }
        assert_eq!(names, vec!["error", "finish"]);
    }

    #[tokio::test]
    async fn show_tasks_returns_history() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = TaskAgent::new(&config(dir.path()), bus.clone()).unwrap();
        agent.setup_queues(&[]).await.unwrap();

        let client = CommandClient::new(bus, ClientOptions::default());
        let handle = client.get_agent_handle("svc", "u1").await.unwrap();
        let call = handle.send_task(SHOW_TASKS, json!({})).await.unwrap();
        let finish = call.finished().await.unwrap();
        assert_eq!(finish.payload["history"], json!([]));
    }

    fn delivery(routing_key: &str, body: Value) -> Delivery {
        Delivery {
            routing_key: routing_key.to_string(),
            body,
            published_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn requests_need_a_reply_address() {
        let req = request_from(&delivery(
            "svc.u1.task.demo",
            json!({"task_id": "t1", "client_id": "c1", "x": 1}),
        ))
        .unwrap();
        assert_eq!(req.task, "demo");
        assert_eq!(req.task_id, "t1");

        assert!(request_from(&delivery("svc.u1.task.demo", json!({"client_id": "c1"}))).is_none());
        assert!(request_from(&delivery("svc.u1.task.demo", json!({"task_id": "t1"}))).is_none());
        assert!(request_from(&delivery("svc.u1.task.demo", json!({}))).is_none());
        assert!(request_from(&delivery("svc.ping.u1", json!({"task_id": "t1", "client_id": "c1"}))).is_none());
    }

    #[tokio::test]
    async fn request_without_ids_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = TaskAgent::new(&config(dir.path()), bus.clone()).unwrap();
        agent.setup_queues(&[]).await.unwrap();

        let mut events = bus
            .subscribe(QueueSpec::new("watch", vec!["svc.u1.event.#".to_string()]))
            .unwrap();
        bus.publish("svc.u1.task.demo", json!({})).unwrap();

        let published = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(published.is_err(), "unexpected event: {published:?}");
        assert!(agent.runner().history(None).await.is_empty());
    }

    #[test]
    fn default_worker_sits_next_to_the_executable() {
        let bin = default_worker_bin().unwrap();
        assert!(
            bin.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(WORKER_BIN_NAME)
        );
    }
}
