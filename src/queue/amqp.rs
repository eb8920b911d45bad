use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio_stream::{Stream, StreamExt};

use super::{BoundQueues, DeliveryHandle, Dequeued, QueueGateway, QueueNames};
use crate::backoff::reconnect_delay;
use crate::config::BrokerConfig;
use crate::error::GatewayError;
use crate::job::JobRecord;
use crate::status::StatusReport;

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

type DeliveryStream = Pin<Box<dyn Stream<Item = (String, Result<Delivery, lapin::Error>)> + Send>>;

struct Session {
    connection: Connection,
    consume: Channel,
    publish: Channel,
    generation: u64,
}

impl Session {
    fn is_healthy(&self) -> bool {
        self.connection.status().connected()
            && self.consume.status().connected()
            && self.publish.status().connected()
    }
}

/// Channels of the current session, detached from the lock.
#[derive(Clone)]
struct SessionHandle {
    consume: Channel,
    publish: Channel,
    generation: u64,
}

/// RabbitMQ gateway.
///
/// Holds one connection with a consume channel (prefetch 1, both job queues)
/// and a publish channel. When the connection drops, the next operation opens
/// a new session under a new generation and, for consumers, re-subscribes.
/// Messages from the old session are redelivered by the broker, so their
/// handles are refused rather than acked on the wrong channel.
pub struct AmqpGateway {
    broker: BrokerConfig,
    consumer_tag: String,
    names: std::sync::Mutex<Option<QueueNames>>,
    session: Mutex<Option<Session>>,
    deliveries: Mutex<Option<(u64, DeliveryStream)>>,
    generation: AtomicU64,
}

impl AmqpGateway {
    /// Open the initial connection. Failure here is a startup error.
    pub async fn connect(broker: BrokerConfig, instance_id: &str) -> Result<Self, GatewayError> {
        let gateway = Self {
            broker,
            consumer_tag: format!(
                "fleet-worker-{}-{}",
                instance_id,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            names: std::sync::Mutex::new(None),
            session: Mutex::new(None),
            deliveries: Mutex::new(None),
            generation: AtomicU64::new(0),
        };
        gateway.ensure_session().await?;
        tracing::info!(
            host = %gateway.broker.host,
            port = gateway.broker.port,
            consumer_tag = %gateway.consumer_tag,
            "Connected to broker"
        );
        Ok(gateway)
    }

    fn bound_names(&self) -> Option<QueueNames> {
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn open_session(&self) -> Result<Session, GatewayError> {
        let connection =
            Connection::connect(&self.broker.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let consume = connection.create_channel().await?;
        consume.basic_qos(1, consume_qos()).await?;
        let publish = connection.create_channel().await?;

        if let Some(names) = self.bound_names() {
            declare_queues(&consume, &names).await?;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            connection,
            consume,
            publish,
            generation,
        })
    }

    /// Current session, reconnecting once if it is gone or unhealthy.
    async fn ensure_session(&self) -> Result<SessionHandle, GatewayError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_healthy() {
                return Ok(SessionHandle {
                    consume: session.consume.clone(),
                    publish: session.publish.clone(),
                    generation: session.generation,
                });
            }
            tracing::warn!(generation = session.generation, "Broker session lost, reconnecting");
        }
        *guard = None;
        let session = self.open_session().await?;
        let handle = SessionHandle {
            consume: session.consume.clone(),
            publish: session.publish.clone(),
            generation: session.generation,
        };
        *guard = Some(session);
        Ok(handle)
    }

    async fn drop_session(&self, generation: u64) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().map(|s| s.generation) == Some(generation) {
            *guard = None;
        }
    }

    async fn consume(
        &self,
        session: &SessionHandle,
        names: &QueueNames,
    ) -> Result<DeliveryStream, GatewayError> {
        let mut streams = Vec::with_capacity(2);
        for (queue, suffix) in [(&names.instance, "instance"), (&names.shared, "shared")] {
            let consumer = session
                .consume
                .basic_consume(
                    queue,
                    &format!("{}-{}", self.consumer_tag, suffix),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            let queue = queue.clone();
            streams.push(consumer.map(move |delivery| (queue.clone(), delivery)));
        }
        let shared = streams.pop();
        let instance = streams.pop();
        match (instance, shared) {
            (Some(instance), Some(shared)) => Ok(Box::pin(instance.merge(shared))),
            _ => Err(GatewayError::NotBound(names.shared.clone())),
        }
    }

    async fn publish_bytes(&self, queue: &str, payload: &[u8]) -> Result<(), GatewayError> {
        let session = self.ensure_session().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        let publish_error = |e: lapin::Error| GatewayError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };
        session
            .publish
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;
        Ok(())
    }

    /// Producer side: put a job record on a queue, declaring it first.
    pub async fn publish_job(&self, queue: &str, job: &JobRecord) -> Result<(), GatewayError> {
        let session = self.ensure_session().await?;
        session
            .publish
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.publish_bytes(queue, &job.to_json_bytes()?).await
    }

    /// Close the connection, letting the broker requeue anything unacked.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.connection.close(200, "worker shutdown").await {
                tracing::debug!(error = %e, "Error closing broker connection");
            }
        }
    }

    async fn session_for(&self, handle: &DeliveryHandle) -> Result<Channel, GatewayError> {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) if session.generation == handle.generation => {
                Ok(session.consume.clone())
            }
            _ => Err(GatewayError::Channel(format!(
                "delivery {} on {} belongs to a closed session; the broker will redeliver it",
                handle.tag, handle.queue
            ))),
        }
    }
}

/// Prefetch settings for the consume channel.
///
/// RabbitMQ applies a non-global prefetch per consumer, and this channel
/// carries two consumers. The channel-wide limit keeps at most one message
/// from either queue unacked at a time.
fn consume_qos() -> BasicQosOptions {
    BasicQosOptions { global: true }
}

async fn declare_queues(channel: &Channel, names: &QueueNames) -> Result<(), GatewayError> {
    for queue in [&names.shared, &names.instance, &names.results] {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

#[async_trait]
impl QueueGateway for AmqpGateway {
    async fn bind_queues(&self, names: &QueueNames) -> Result<BoundQueues, GatewayError> {
        *self
            .names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(names.clone());
        let session = self.ensure_session().await?;
        declare_queues(&session.consume, names).await?;
        let stream = self.consume(&session, names).await?;
        *self.deliveries.lock().await = Some((session.generation, stream));
        tracing::info!(
            shared = %names.shared,
            instance = %names.instance,
            results = %names.results,
            "Bound worker queues"
        );
        Ok(BoundQueues {
            shared: names.shared.clone(),
            instance: names.instance.clone(),
        })
    }

    async fn dequeue(&self) -> Result<Dequeued, GatewayError> {
        let names = self
            .bound_names()
            .ok_or_else(|| GatewayError::NotBound("job queues".to_string()))?;
        let mut attempt: u32 = 0;
        loop {
            let session = match self.ensure_session().await {
                Ok(session) => session,
                Err(e) => {
                    let delay = reconnect_delay(attempt, RECONNECT_BASE, RECONNECT_MAX);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Broker reconnect failed"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let mut deliveries = self.deliveries.lock().await;
            let current = deliveries.as_ref().map(|(generation, _)| *generation);
            if current != Some(session.generation) {
                match self.consume(&session, &names).await {
                    Ok(stream) => *deliveries = Some((session.generation, stream)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to resume consuming");
                        *deliveries = None;
                        drop(deliveries);
                        self.drop_session(session.generation).await;
                        tokio::time::sleep(reconnect_delay(attempt, RECONNECT_BASE, RECONNECT_MAX))
                            .await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                }
            }

            let Some((generation, stream)) = deliveries.as_mut() else {
                continue;
            };
            let generation = *generation;
            match stream.next().await {
                Some((queue, Ok(delivery))) => {
                    let handle = DeliveryHandle {
                        queue,
                        tag: delivery.delivery_tag,
                        generation,
                    };
                    return Ok(Dequeued::from_payload(handle, &delivery.data));
                }
                Some((queue, Err(e))) => {
                    tracing::warn!(queue = %queue, error = %e, "Consumer failed");
                }
                None => {
                    tracing::warn!("Consumer stream ended");
                }
            }
            *deliveries = None;
            drop(deliveries);
            self.drop_session(generation).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn publish_status(&self, report: &StatusReport) -> Result<(), GatewayError> {
        let names = self
            .bound_names()
            .ok_or_else(|| GatewayError::NotBound("results queue".to_string()))?;
        self.publish_bytes(&names.results, &report.to_json_bytes()?)
            .await
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), GatewayError> {
        let channel = self.session_for(&handle).await?;
        channel
            .basic_ack(handle.tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), GatewayError> {
        let channel = self.session_for(&handle).await?;
        channel
            .basic_reject(handle.tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }
}
