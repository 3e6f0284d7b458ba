//! `TaskAgent` Daemon Library
//!
//! Control-process side of `TaskAgent`:
//! - Publish/subscribe transport seam and the in-process topic bus
//! - Admission queues bounding concurrent task execution
//! - Worker subprocess runner and task history
//! - Command client for sending tasks to agents
//! - Subtask delegation between sibling agents
//! - HTTP facade

pub mod admission;
pub mod agent;
pub mod client;
pub mod dispatch;
pub mod http;
pub mod runner;
pub mod transport;

pub use agent::TaskAgent;
