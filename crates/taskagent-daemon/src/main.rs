//! `TaskAgent` Daemon
//!
//! Serves the configured task queues, runs each admitted request in an
//! isolated worker process and optionally exposes the HTTP facade.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use taskagent_core::config::{Config, load_config, merge_config, read_config_file};
use taskagent_core::tracing_init::init_tracing;
use taskagent_daemon::TaskAgent;
use taskagent_daemon::http::{AppState, build_router};
use taskagent_daemon::transport::{MemoryBus, Transport};

#[derive(Parser, Debug)]
#[command(name = "taskagent-daemon")]
#[command(version, about = "TaskAgent daemon - admission-controlled task execution")]
struct Args {
    /// Extra settings file layered over the global and project config
    #[arg(long, env = "TASKAGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Resource type served by this agent
    #[arg(long)]
    resource: Option<String>,

    /// Fixed agent uuid (random when unset)
    #[arg(long)]
    uuid: Option<String>,

    /// Directory holding per-task assets such as schema files
    #[arg(long)]
    tasks_path: Option<PathBuf>,

    /// Directory receiving per-task worker logs
    #[arg(long)]
    task_log_dir: Option<PathBuf>,

    /// Path to the `taskagent-worker` binary
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// Serve the HTTP facade on this address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "TASKAGENT_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TASKAGENT_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(resource) = self.resource {
            config.agent.resource = resource;
        }
        if self.uuid.is_some() {
            config.agent.uuid = self.uuid;
        }
        if let Some(path) = self.tasks_path {
            config.agent.tasks_path = path;
        }
        if let Some(dir) = self.task_log_dir {
            config.agent.task_log_dir = dir;
        }
        if self.worker_bin.is_some() {
            config.agent.worker_bin = self.worker_bin;
        }
        if let Some(addr) = self.http_addr {
            config.http.enabled = true;
            config.http.addr = addr;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("taskagent_daemon={0},taskagent_core={0}", args.log_level);
    init_tracing(&log_filter, args.log_json);

    let cwd = std::env::current_dir().ok();
    let mut config = load_config(cwd.as_deref())?;
    if let Some(path) = &args.config {
        merge_config(&mut config, read_config_file(path)?)?;
    }
    args.apply(&mut config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        resource = %config.agent.resource,
        http = config.http.enabled,
        "Starting taskagent-daemon"
    );

    let transport: Arc<dyn Transport> = Arc::new(MemoryBus::new());
    let agent = TaskAgent::new(&config, Arc::clone(&transport))?;
    agent.setup_queues(&config.queue_definitions()).await?;
    agent
        .start_heartbeat(Duration::from_secs(config.agent.heartbeat_secs.max(1)))
        .await;

    let http_handle = if config.http.enabled {
        let app = build_router(AppState {
            runner: agent.runner().clone(),
            dispatcher: agent.dispatcher(),
        });
        let listener = tokio::net::TcpListener::bind(config.http.addr).await?;
        info!(addr = %config.http.addr, "HTTP facade listening");
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "HTTP facade stopped");
            }
        }))
    } else {
        None
    };

    info!(uuid = %agent.uuid(), "Agent ready");
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    if let Some(handle) = http_handle {
        handle.abort();
    }
    agent.shutdown().await;
    Ok(())
}
