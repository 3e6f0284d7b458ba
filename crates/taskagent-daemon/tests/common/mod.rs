//! Shared fixtures for the daemon integration suites.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use taskagent_core::config::{Config, QueueConfig};
use taskagent_daemon::runner::{ChildProcessRunner, RunnerConfig};

/// The worker binary built alongside these tests.
pub fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_taskagent-worker"))
}

pub fn runner_config(dir: &Path) -> RunnerConfig {
    RunnerConfig::new(worker_bin(), dir.join("tasks"), dir.join("logs"))
}

pub fn runner(dir: &Path) -> ChildProcessRunner {
    ChildProcessRunner::new(runner_config(dir))
}

/// Agent config for `resource` under the shared uuid `u1`.
pub fn agent_config(dir: &Path, resource: &str) -> Config {
    let mut config = Config::default();
    config.agent.resource = resource.to_string();
    config.agent.uuid = Some("u1".to_string());
    config.agent.worker_bin = Some(worker_bin());
    config.agent.tasks_path = dir.join("tasks");
    config.agent.task_log_dir = dir.join("logs");
    config
}

pub fn queue(name: &str, tasks: &[&str], max_concurrent: usize) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        tasks: tasks.iter().map(ToString::to_string).collect(),
        max_concurrent,
        message_ttl_ms: None,
    }
}
