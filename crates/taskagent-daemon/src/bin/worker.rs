//! `TaskAgent` worker process.
//!
//! Started by the daemon with the task name as its only argument. Stdin and
//! stdout carry the NDJSON IPC stream; logs go to the file named by
//! `TASKAGENT_LOGFILE`.

use std::path::PathBuf;

use clap::Parser;

use taskagent_core::tracing_init::{init_file_tracing, init_tracing};
use taskagent_task::builtin_registry;
use taskagent_task::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "taskagent-worker")]
#[command(version, about = "TaskAgent worker - executes one task over stdio IPC")]
struct Args {
    /// Task type to execute
    task: String,

    /// Per-task log file
    #[arg(long, env = "TASKAGENT_LOGFILE")]
    log_file: Option<PathBuf>,

    /// Log level filter for the worker
    #[arg(long, default_value = "debug", env = "TASKAGENT_WORKER_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_filter = format!("taskagent_task={0},taskagent_worker={0}", args.log_level);
    match &args.log_file {
        Some(path) => init_file_tracing(path, &log_filter),
        None => init_tracing(&log_filter, false),
    }

    let registry = builtin_registry();
    let code = run_worker(&registry, &args.task, tokio::io::stdin(), tokio::io::stdout()).await;
    std::process::exit(code);
}
