//! Message-broker side of the worker.
//!
//! A worker consumes from two queues at once: the fleet-wide job queue and a
//! queue named after its own instance, so a dispatcher can either hand work
//! to whoever is free or target one machine. Status reports go to a third,
//! results queue.
//!
//! - [`QueueGateway`]: the operations the worker loop and heartbeat need
//! - [`amqp::AmqpGateway`]: RabbitMQ implementation over `lapin`
//! - [`memory::InMemoryBroker`]: in-process broker for tests and dry runs
//!
//! Delivery is at-least-once: a message is acked or rejected only after the
//! worker has reached a terminal decision for it.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::error::{GatewayError, JobError};
use crate::job::JobRecord;
use crate::status::StatusReport;

pub use amqp::AmqpGateway;
pub use memory::{InMemoryBroker, InMemoryGateway};

/// Queue names for one worker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub shared: String,
    pub instance: String,
    pub results: String,
}

impl QueueNames {
    pub fn for_instance(base: &str, instance_id: &str) -> Self {
        Self {
            shared: format!("{}_jobs", base),
            instance: format!("{}_jobs_{}", base, instance_id),
            results: format!("{}_results", base),
        }
    }

    pub fn from_config(config: &WorkerConfig, instance_id: &str) -> Self {
        let mut names = Self::for_instance(&config.queue_name, instance_id);
        if let Some(results) = &config.results_queue {
            names.results = results.clone();
        }
        names
    }
}

/// Queues a gateway is consuming from after [`QueueGateway::bind_queues`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQueues {
    pub shared: String,
    pub instance: String,
}

/// Opaque reference to one in-flight delivery.
///
/// `generation` identifies the broker session the message arrived on; a
/// handle from a session that has since been replaced can no longer be acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub queue: String,
    pub tag: u64,
    pub generation: u64,
}

/// A message taken off one of the bound queues.
#[derive(Debug)]
pub struct Dequeued {
    pub handle: DeliveryHandle,
    pub job: Result<JobRecord, JobError>,
}

impl Dequeued {
    pub fn from_payload(handle: DeliveryHandle, payload: &[u8]) -> Self {
        Self {
            handle,
            job: JobRecord::from_json_bytes(payload),
        }
    }
}

#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Declare and start consuming the shared and per-instance queues, and
    /// declare the results queue.
    async fn bind_queues(&self, names: &QueueNames) -> Result<BoundQueues, GatewayError>;

    /// Wait for the next message on either bound queue.
    async fn dequeue(&self) -> Result<Dequeued, GatewayError>;

    /// Send a status report to the results queue. Callers log failures and
    /// carry on; a report is never worth killing a job over.
    async fn publish_status(&self, report: &StatusReport) -> Result<(), GatewayError>;

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), GatewayError>;

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), GatewayError>;
}
