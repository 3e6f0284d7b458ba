//! Configuration resolution for `TaskAgent`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/taskagent/settings.json)
//! 3. Project config (.taskagent/settings.json)
//! 4. Environment variables (`TASKAGENT_*`)
//! 5. CLI arguments (highest priority, applied by the daemon binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::truncate::MAX_LOG_STRING_LEN;

/// Name of the queue serving built-in demo tasks when none are configured.
pub const DEFAULT_QUEUE: &str = "demo_tasks";

/// Complete `TaskAgent` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Queue definitions to bind, falling back to the demo queue.
    pub fn queue_definitions(&self) -> Vec<QueueConfig> {
        if self.queues.is_empty() {
            vec![QueueConfig {
                name: DEFAULT_QUEUE.to_string(),
                tasks: vec!["demo".to_string()],
                max_concurrent: 4,
                message_ttl_ms: None,
            }]
        } else {
            self.queues.clone()
        }
    }
}

/// Identity and runtime settings of the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Resource type this agent serves (first word of every address).
    pub resource: String,
    /// Fixed agent identity; a fresh v4 uuid is generated when unset.
    pub uuid: Option<String>,
    /// Directory holding per-task assets such as `<task>/schema.json`.
    pub tasks_path: PathBuf,
    /// Directory receiving per-task worker log files.
    pub task_log_dir: PathBuf,
    /// Worker executable; defaults to `taskagent-worker` next to the daemon.
    pub worker_bin: Option<PathBuf>,
    /// Number of history entries retained by the runner.
    pub max_history: usize,
    /// Strings in logged events are cut to this many characters.
    pub max_log_string_len: usize,
    /// Seconds between heartbeat publishes.
    pub heartbeat_secs: u64,
    /// Timeout applied to the agent's own handle for delegated subtasks.
    pub delegation_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            resource: "taskagent".to_string(),
            uuid: None,
            tasks_path: PathBuf::from("tasks"),
            task_log_dir: std::env::temp_dir().join("taskagent-logs"),
            worker_bin: None,
            max_history: 1000,
            max_log_string_len: MAX_LOG_STRING_LEN,
            heartbeat_secs: 30,
            delegation_timeout_secs: 600,
        }
    }
}

/// Caller-side settings for agent handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds a call may stay without a terminal event.
    pub timeout_secs: u64,
    /// Cap on outstanding calls per handle; unbounded when unset.
    pub max_outstanding: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            max_outstanding: None,
        }
    }
}

/// One admission queue binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Task names routed into this queue.
    pub tasks: Vec<String>,
    /// Maximum concurrently executing requests.
    pub max_concurrent: usize,
    /// Per-message time-to-live, passed through to the transport.
    #[serde(default)]
    pub message_ttl_ms: Option<u64>,
}

/// Optional HTTP facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        tracing::debug!(path = %global_path.display(), "Loading global config");
        merge_config(&mut config, read_config_file(&global_path)?)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".taskagent").join("settings.json");
        if project_path.exists() {
            tracing::debug!(path = %project_path.display(), "Loading project config");
            merge_config(&mut config, read_config_file(&project_path)?)?;
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("taskagent").join("settings.json"))
}

/// Read one settings file as raw JSON, keeping only the keys it sets.
pub fn read_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Read and parse one settings file on top of the built-in defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, read_config_file(path)?)?;
    Ok(config)
}

/// Overlay the keys present in `overlay` onto `base`.
///
/// Sections merge key by key, so a layer only overrides what it spells
/// out. `null` and empty lists leave the base value in place; any other
/// list replaces it whole.
pub fn merge_config(base: &mut Config, overlay: Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_values(&mut merged, overlay);
    *base = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid config value: {e}")))?;
    Ok(())
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (_, Value::Array(items)) if items.is_empty() => {}
        (slot, value) => *slot = value,
    }
}

/// Apply `TASKAGENT_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TASKAGENT_RESOURCE") {
        config.agent.resource = val;
    }
    if let Some(val) = lookup("TASKAGENT_UUID") {
        config.agent.uuid = Some(val);
    }
    if let Some(val) = lookup("TASKAGENT_TASKS_PATH") {
        config.agent.tasks_path = PathBuf::from(val);
    }
    if let Some(val) = lookup("TASKAGENT_TASK_LOG_DIR") {
        config.agent.task_log_dir = PathBuf::from(val);
    }
    if let Some(val) = lookup("TASKAGENT_WORKER_BIN") {
        config.agent.worker_bin = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("TASKAGENT_CLIENT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.client.timeout_secs = n;
    }
    if let Some(n) = lookup("TASKAGENT_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
        config.agent.heartbeat_secs = n;
    }
    if let Some(addr) = lookup("TASKAGENT_HTTP_ADDR").and_then(|v| v.parse().ok()) {
        config.http.enabled = true;
        config.http.addr = addr;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.client.timeout_secs, 5);
        assert_eq!(config.agent.heartbeat_secs, 30);
        assert_eq!(config.agent.delegation_timeout_secs, 600);
        assert_eq!(config.agent.max_log_string_len, 1000);
        assert!(config.client.max_outstanding.is_none());
    }

    #[test]
    fn empty_queue_list_falls_back_to_demo_queue() {
        let queues = Config::default().queue_definitions();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, DEFAULT_QUEUE);
        assert_eq!(queues[0].tasks, vec!["demo".to_string()]);
        assert_eq!(queues[0].max_concurrent, 4);
    }

    #[test]
    fn project_file_is_parsed_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join(".taskagent");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(
            settings.join("settings.json"),
            r#"{
                "agent": {"resource": "provisioner"},
                "queues": [{"name": "builds", "tasks": ["build"], "max_concurrent": 2}]
            }"#,
        )
        .unwrap();

        let config = load_config_file(&settings.join("settings.json")).unwrap();

        assert_eq!(config.agent.resource, "provisioner");
        assert_eq!(config.agent.heartbeat_secs, 30);
        assert_eq!(config.queue_definitions()[0].name, "builds");
        assert_eq!(config.queue_definitions()[0].message_ttl_ms, None);
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn mistyped_value_is_a_config_error() {
        let mut config = Config::default();
        let err = merge_config(&mut config, json!({"agent": {"heartbeat_secs": "often"}}));
        assert!(matches!(err, Err(Error::Config(_))));
        assert_eq!(config.agent.heartbeat_secs, 30);
    }

    #[test]
    fn merge_keeps_unset_optionals() {
        let mut base = Config::default();
        base.agent.uuid = Some("fixed".to_string());
        merge_config(&mut base, json!({"agent": {"uuid": null}})).unwrap();
        assert_eq!(base.agent.uuid.as_deref(), Some("fixed"));
    }

    #[test]
    fn queue_only_overlay_keeps_lower_layers() {
        let mut base = Config::default();
        merge_config(
            &mut base,
            json!({
                "agent": {"resource": "provisioner", "heartbeat_secs": 5},
                "client": {"timeout_secs": 60},
                "http": {"enabled": true, "addr": "0.0.0.0:9000"}
            }),
        )
        .unwrap();

        merge_config(
            &mut base,
            json!({"queues": [{"name": "builds", "tasks": ["build"], "max_concurrent": 2}]}),
        )
        .unwrap();

        assert_eq!(base.agent.resource, "provisioner");
        assert_eq!(base.agent.heartbeat_secs, 5);
        assert_eq!(base.client.timeout_secs, 60);
        assert!(base.http.enabled);
        assert_eq!(base.http.addr.port(), 9000);
        assert_eq!(base.queues.len(), 1);
    }

    #[test]
    fn partial_section_overrides_only_its_keys() {
        let mut base = Config::default();
        base.agent.resource = "provisioner".to_string();
        base.agent.max_history = 10;

        merge_config(&mut base, json!({"agent": {"max_history": 50}, "queues": []})).unwrap();

        assert_eq!(base.agent.resource, "provisioner");
        assert_eq!(base.agent.max_history, 50);
        assert_eq!(base.agent.heartbeat_secs, 30);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TASKAGENT_RESOURCE", "builder"),
            ("TASKAGENT_CLIENT_TIMEOUT_SECS", "12"),
            ("TASKAGENT_HEARTBEAT_SECS", "not-a-number"),
            ("TASKAGENT_HTTP_ADDR", "0.0.0.0:9000"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));
        assert_eq!(config.agent.resource, "builder");
        assert_eq!(config.client.timeout_secs, 12);
        assert_eq!(config.agent.heartbeat_secs, 30);
        assert!(config.http.enabled);
        assert_eq!(config.http.addr.port(), 9000);
    }
}
