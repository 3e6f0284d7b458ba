//! Subprocess execution for task steps.

use std::collections::BTreeMap;
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::TaskError;

/// Captured result of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub exitstatus: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub const fn success(&self) -> bool {
        matches!(self.exitstatus, Some(0))
    }
}

/// Run `bin` to completion with `env` added to the inherited environment.
pub(crate) async fn capture(
    bin: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<ProcessOutput, TaskError> {
    debug!(bin, ?args, "Running subprocess");
    let output = Command::new(bin)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TaskError::Process {
            bin: bin.to_string(),
            reason: e.to_string(),
        })?;

    Ok(ProcessOutput {
        exitstatus: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
