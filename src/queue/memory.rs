use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BoundQueues, DeliveryHandle, Dequeued, QueueGateway, QueueNames};
use crate::error::GatewayError;
use crate::job::JobRecord;
use crate::status::StatusReport;

/// A message the broker has handed out and is waiting to hear back about.
#[derive(Debug, Clone)]
struct InFlight {
    queue: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub queue: String,
    pub tag: u64,
    pub payload: Vec<u8>,
    /// `None` for an ack, `Some(requeue)` for a reject.
    pub rejected: Option<bool>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    in_flight: HashMap<u64, InFlight>,
    settled: Vec<Settled>,
    next_tag: u64,
    fail_publishes: bool,
    closed: bool,
}

/// In-process broker with named FIFO queues and explicit ack/reject.
///
/// Cheap to clone; every clone and every gateway made from it sees the same
/// queues, so several workers can compete for one shared queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A gateway for one worker. Nothing is consumed until it binds.
    pub fn gateway(&self) -> InMemoryGateway {
        InMemoryGateway {
            broker: self.clone(),
            bound: Mutex::new(None),
        }
    }

    pub fn publish(&self, queue: &str, payload: Vec<u8>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    pub fn publish_job(&self, queue: &str, job: &JobRecord) -> Result<(), GatewayError> {
        self.publish(queue, job.to_json_bytes()?);
        Ok(())
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Every ack and reject seen so far, in order.
    pub fn settled(&self) -> Vec<Settled> {
        self.lock().settled.clone()
    }

    pub fn acked(&self) -> Vec<Settled> {
        self.settled()
            .into_iter()
            .filter(|s| s.rejected.is_none())
            .collect()
    }

    pub fn rejected(&self) -> Vec<Settled> {
        self.settled()
            .into_iter()
            .filter(|s| s.rejected.is_some())
            .collect()
    }

    /// Decode everything published to a results queue, oldest first.
    pub fn status_reports(&self, queue: &str) -> Vec<StatusReport> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.iter()
                    .filter_map(|payload| serde_json::from_slice(payload).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make every subsequent status publish fail, as if the broker were
    /// unreachable for publishers.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Wake every blocked consumer with [`GatewayError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn take_next(&self, names: &QueueNames) -> Option<(DeliveryHandle, Vec<u8>)> {
        let mut state = self.lock();
        // Directed work first, then the fleet-wide queue.
        for queue in [&names.instance, &names.shared] {
            let payload = match state.queues.get_mut(queue.as_str()) {
                Some(q) => q.pop_front(),
                None => None,
            };
            if let Some(payload) = payload {
                state.next_tag += 1;
                let tag = state.next_tag;
                state.in_flight.insert(
                    tag,
                    InFlight {
                        queue: queue.clone(),
                        payload: payload.clone(),
                    },
                );
                let handle = DeliveryHandle {
                    queue: queue.clone(),
                    tag,
                    generation: 0,
                };
                return Some((handle, payload));
            }
        }
        None
    }

    fn settle(&self, handle: &DeliveryHandle, rejected: Option<bool>) -> Result<(), GatewayError> {
        let mut state = self.lock();
        let in_flight = state.in_flight.remove(&handle.tag).ok_or_else(|| {
            GatewayError::Channel(format!("unknown delivery tag {}", handle.tag))
        })?;
        if rejected == Some(true) {
            state
                .queues
                .entry(in_flight.queue.clone())
                .or_default()
                .push_front(in_flight.payload.clone());
        }
        state.settled.push(Settled {
            queue: in_flight.queue,
            tag: handle.tag,
            payload: in_flight.payload,
            rejected,
        });
        drop(state);
        if rejected == Some(true) {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

/// One worker's connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryGateway {
    broker: InMemoryBroker,
    bound: Mutex<Option<QueueNames>>,
}

impl InMemoryGateway {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn names(&self) -> Result<QueueNames, GatewayError> {
        self.bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| GatewayError::NotBound("job queues".to_string()))
    }
}

#[async_trait]
impl QueueGateway for InMemoryGateway {
    async fn bind_queues(&self, names: &QueueNames) -> Result<BoundQueues, GatewayError> {
        {
            let mut state = self.broker.lock();
            for queue in [&names.shared, &names.instance, &names.results] {
                state.queues.entry(queue.clone()).or_default();
            }
        }
        *self
            .bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(names.clone());
        Ok(BoundQueues {
            shared: names.shared.clone(),
            instance: names.instance.clone(),
        })
    }

    async fn dequeue(&self) -> Result<Dequeued, GatewayError> {
        let names = self.names()?;
        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a publish in between is not missed.
            notified.as_mut().enable();

            if let Some((handle, payload)) = self.broker.take_next(&names) {
                return Ok(Dequeued::from_payload(handle, &payload));
            }
            if self.broker.lock().closed {
                return Err(GatewayError::Closed);
            }
            notified.await;
        }
    }

    async fn publish_status(&self, report: &StatusReport) -> Result<(), GatewayError> {
        let names = self.names()?;
        if self.broker.lock().fail_publishes {
            return Err(GatewayError::Publish {
                queue: names.results,
                reason: "broker unreachable".to_string(),
            });
        }
        self.broker.publish(&names.results, report.to_json_bytes()?);
        Ok(())
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), GatewayError> {
        self.broker.settle(&handle, None)
    }

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), GatewayError> {
        self.broker.settle(&handle, Some(requeue))
    }
}
