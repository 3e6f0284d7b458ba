//! In-process topic exchange.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use taskagent_core::routing::topic_matches;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Delivery, QueueSpec, Subscription, Transport, TransportError};

struct Binding {
    queue: String,
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Topic exchange living in this process. Cloning shares the exchange.
///
/// Each subscription is its own queue; a message matching several of a
/// queue's patterns is delivered to it once.
#[derive(Clone, Default)]
pub struct MemoryBus {
    bindings: Arc<Mutex<Vec<Binding>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live queue bindings.
    pub fn binding_count(&self) -> usize {
        let mut bindings = self.lock();
        bindings.retain(|b| !b.tx.is_closed());
        bindings.len()
    }
}

impl Transport for MemoryBus {
    fn publish(&self, routing_key: &str, body: Value) -> Result<(), TransportError> {
        let published_at = Instant::now();
        let mut bindings = self.lock();
        bindings.retain(|b| !b.tx.is_closed());

        let mut delivered = 0usize;
        for binding in bindings.iter() {
            if binding
                .patterns
                .iter()
                .any(|p| topic_matches(p, routing_key))
            {
                let delivery = Delivery {
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    published_at,
                };
                if binding.tx.send(delivery).is_ok() {
                    delivered += 1;
                    trace!(queue = %binding.queue, routing_key, "Delivered");
                }
            }
        }
        drop(bindings);

        if delivered == 0 {
            debug!(routing_key, "Published message matched no queue");
        }
        Ok(())
    }

    fn subscribe(&self, spec: QueueSpec) -> Result<Subscription, TransportError> {
        if spec.patterns.is_empty() {
            return Err(TransportError::NoPatterns { queue: spec.name });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(queue = %spec.name, patterns = ?spec.patterns, "Binding queue");
        self.lock().push(Binding {
            queue: spec.name.clone(),
            patterns: spec.patterns,
            tx,
        });
        Ok(Subscription::new(spec.name, spec.message_ttl, rx))
    }
}
