//! `TaskAgent` Core Library
//!
//! Shared functionality for `TaskAgent` components:
//! - Task data model (requests, lifecycle events, structured log entries)
//! - NDJSON codec for the control-process/worker IPC protocol
//! - Routing address grammar and topic pattern matching
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod ipc;
pub mod model;
pub mod routing;
pub mod tracing_init;
pub mod truncate;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{LogEntry, LogLevel, TaskEvent, TaskRequest};
pub use routing::RoutingKey;
