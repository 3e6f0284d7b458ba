//! Publish/subscribe transport seam.
//!
//! Everything above this module talks to the messaging fabric through the
//! [`Transport`] trait: publish a JSON body under a routing address, or
//! subscribe a named queue to a set of topic patterns.

pub mod memory;

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

pub use memory::MemoryBus;

/// One message taken off a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Value,
    pub published_at: Instant,
}

/// Queue declaration passed to [`Transport::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Topic patterns bound to the queue.
    pub patterns: Vec<String>,
    /// Messages older than this are discarded instead of delivered.
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns,
            message_ttl: None,
        }
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.message_ttl = ttl;
        self
    }
}

/// Receiving side of a bound queue. Dropping it unbinds the queue.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    ttl: Option<Duration>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub(crate) const fn new(
        queue: String,
        ttl: Option<Duration>,
        rx: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self { queue, ttl, rx }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next live delivery in publish order. `None` once the transport is
    /// gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let delivery = self.rx.recv().await?;
            match self.ttl {
                Some(ttl) if delivery.published_at.elapsed() > ttl => {
                    debug!(
                        queue = %self.queue,
                        routing_key = %delivery.routing_key,
                        "Dropping expired message"
                    );
                }
                _ => return Some(delivery),
            }
        }
    }
}

/// The messaging fabric.
pub trait Transport: Send + Sync + 'static {
    /// Publish `body` under `routing_key`. Never blocks.
    fn publish(&self, routing_key: &str, body: Value) -> Result<(), TransportError>;

    /// Bind a queue to `spec.patterns` and start consuming it.
    fn subscribe(&self, spec: QueueSpec) -> Result<Subscription, TransportError>;
}

/// Errors from the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Queue {queue} has no routing patterns")]
    NoPatterns { queue: String },
}
