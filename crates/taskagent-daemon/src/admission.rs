//! Bounded-concurrency admission of messages off a queue.
//!
//! An [`AdmissionQueue`] holds a semaphore of `max_concurrent` permits. The
//! consume loop acquires a permit before taking the next delivery, so the
//! queue never hands out more than `max_concurrent` uncompleted messages and
//! deliveries are handed out in arrival order.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{Delivery, QueueSpec, Transport, TransportError};

/// Callback receiving each admitted delivery.
///
/// Must not block: long-running work is spawned and the [`Completion`]
/// moved into it.
pub type DeliveryHandler = Arc<dyn Fn(Delivery, Completion) + Send + Sync>;

/// Proof that one admitted delivery is still in flight.
///
/// Calling [`Completion::complete`] (or dropping it) frees the slot for the
/// next delivery.
#[derive(Debug)]
pub struct Completion {
    _permit: OwnedSemaphorePermit,
}

impl Completion {
    /// Mark the delivery as handled.
    pub fn complete(self) {}
}

/// A queue consumer admitting at most `max_concurrent` deliveries at a time.
pub struct AdmissionQueue {
    name: String,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    consumer: JoinHandle<()>,
}

impl AdmissionQueue {
    /// Subscribe `spec` on `transport` and start handing deliveries to
    /// `handler`.
    pub fn bind(
        transport: &dyn Transport,
        spec: QueueSpec,
        max_concurrent: usize,
        handler: DeliveryHandler,
    ) -> Result<Self, TransportError> {
        let max_concurrent = if max_concurrent == 0 {
            warn!(queue = %spec.name, "max_concurrent of 0 would stall the queue, using 1");
            1
        } else {
            max_concurrent
        };

        let name = spec.name.clone();
        let mut subscription = transport.subscribe(spec)?;
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        info!(queue = %name, max_concurrent, "Admission queue bound");

        let permits = Arc::clone(&semaphore);
        let queue = name.clone();
        let consumer = tokio::spawn(async move {
            loop {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let Some(delivery) = subscription.recv().await else {
                    debug!(queue = %queue, "Transport closed, stopping consumer");
                    break;
                };
                debug!(queue = %queue, routing_key = %delivery.routing_key, "Admitted");
                handler(delivery, Completion { _permit: permit });
            }
        });

        Ok(Self {
            name,
            semaphore,
            max_concurrent,
            consumer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Free admission slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Deliveries handed out and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.available()
    }
}

impl Drop for AdmissionQueue {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}
