//! rdkafka-backed broker client
//!
//! This module implements [`BrokerClient`] on top of rdkafka's `StreamConsumer`
//! and `FutureProducer`. librdkafka reports connection trouble through the
//! client context rather than through individual calls, so a custom
//! [`ClientContext`] forwards those reports into the connection's event stream
//! where the lifecycle manager picks them up.
//!
//! Consumers use manual partition assignment with auto-commit disabled: the
//! committed position lives in the external offset store, never in Kafka.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    BrokerClient, ConnectionEvent, ConsumerConnection, EventSink, EventStream, ProducerConnection,
};
use crate::config::ControllerConfig;
use crate::kafka::constants::METADATA_TIMEOUT_MS;
use crate::kafka::error::{ControllerError, Result};
use crate::kafka::messages::{Assignment, OutboundRecord, RawMessage};

/// Client context that turns librdkafka error callbacks into connection events
pub struct EventContext {
    events: EventSink,
}

impl ClientContext for EventContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!("librdkafka error: {} ({})", error, reason);
        let _ = self
            .events
            .send(ConnectionEvent::Error(format!("{}: {}", error, reason)));
    }
}

impl ConsumerContext for EventContext {}

/// Broker client backed by librdkafka
pub struct RdKafkaBroker {
    config: Arc<ControllerConfig>,
}

impl RdKafkaBroker {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self { config }
    }

    fn base_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", self.config.bootstrap_servers());
        client_config.set("client.id", &self.config.client_id);
        client_config
    }

    fn consumer_config(&self, group: Option<&str>) -> ClientConfig {
        let mut client_config = self.base_config();

        // librdkafka wants a group id even for manual assignment; the search
        // scanner has none of its own.
        let group_id = group
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-search", self.config.client_id));
        client_config.set("group.id", group_id);

        // Offsets are checkpointed in the external store only
        client_config.set("enable.auto.commit", "false");
        client_config.set("enable.auto.offset.store", "false");
        client_config.set("auto.offset.reset", "earliest");
        client_config.set("enable.partition.eof", "false");
        client_config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut client_config = self.base_config();
        client_config.set(
            "message.timeout.ms",
            self.config.delivery_timeout.as_millis().to_string(),
        );
        client_config.set("acks", "1");
        // Ordering within the buffer is handled above the client; avoid
        // librdkafka reordering on its own retries.
        client_config.set("max.in.flight.requests.per.connection", "1");
        client_config
    }
}

#[async_trait]
impl BrokerClient for RdKafkaBroker {
    async fn connect_consumer(
        &self,
        group: Option<&str>,
        assignments: &[Assignment],
    ) -> Result<(Arc<dyn ConsumerConnection>, EventStream)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = EventContext {
            events: events_tx.clone(),
        };

        let consumer: StreamConsumer<EventContext> = self
            .consumer_config(group)
            .create_with_context(context)
            .map_err(|e| ControllerError::Broker(format!("Failed to create consumer: {}", e)))?;
        let consumer = Arc::new(consumer);

        let connection = RdKafkaConsumerConnection {
            consumer: consumer.clone(),
            assignments: Mutex::new(Vec::new()),
            recv_task: Mutex::new(None),
        };
        for assignment in assignments {
            connection.assign(assignment)?;
        }

        let task = tokio::spawn(recv_loop(consumer, events_tx.clone()));
        *connection.recv_task.lock() = Some(task);

        let _ = events_tx.send(ConnectionEvent::Ready);
        Ok((Arc::new(connection), events_rx))
    }

    async fn connect_producer(&self) -> Result<(Arc<dyn ProducerConnection>, EventStream)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = EventContext {
            events: events_tx.clone(),
        };

        let producer: FutureProducer<EventContext> = self
            .producer_config()
            .create_with_context(context)
            .map_err(|e| ControllerError::Broker(format!("Failed to create producer: {}", e)))?;
        let producer = Arc::new(producer);

        // Ready once the cluster answers a metadata request
        let checker = producer.clone();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                checker
                    .client()
                    .fetch_metadata(None, Duration::from_millis(METADATA_TIMEOUT_MS))
                    .map(|metadata| metadata.brokers().len())
            })
            .await;

            let event = match outcome {
                Ok(Ok(brokers)) if brokers > 0 => ConnectionEvent::Ready,
                Ok(Ok(_)) => ConnectionEvent::Error("metadata lists no brokers".to_string()),
                Ok(Err(e)) => ConnectionEvent::Error(format!("metadata fetch failed: {}", e)),
                Err(e) => ConnectionEvent::Error(format!("metadata fetch panicked: {}", e)),
            };
            let _ = events_tx.send(event);
        });

        let connection = RdKafkaProducerConnection {
            producer,
            delivery_timeout: self.config.delivery_timeout,
        };
        Ok((Arc::new(connection), events_rx))
    }
}

/// Pump messages from the consumer into the event stream until it fails
async fn recv_loop(consumer: Arc<StreamConsumer<EventContext>>, events: EventSink) {
    loop {
        let next = consumer.recv().await.map(|m| RawMessage {
            topic: m.topic().to_string(),
            partition: m.partition(),
            offset: m.offset(),
            key: m.key().map(Bytes::copy_from_slice),
            payload: m.payload().map(Bytes::copy_from_slice),
            // Not reported per message; the search scanner fetches its own
            high_water_offset: None,
        });

        let event = match next {
            Ok(raw) => ConnectionEvent::Message(raw),
            Err(e) => ConnectionEvent::Error(e.to_string()),
        };
        let failed = matches!(event, ConnectionEvent::Error(_));
        if events.send(event).is_err() || failed {
            debug!("consumer receive loop finished");
            return;
        }
    }
}

struct RdKafkaConsumerConnection {
    consumer: Arc<StreamConsumer<EventContext>>,
    assignments: Mutex<Vec<Assignment>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RdKafkaConsumerConnection {
    /// Add one assignment and re-assign the full partition list
    fn assign(&self, assignment: &Assignment) -> Result<()> {
        let mut assignments = self.assignments.lock();
        assignments.push(assignment.clone());

        let mut tpl = TopicPartitionList::new();
        for a in assignments.iter() {
            let offset = a.offset.map(Offset::Offset).unwrap_or(Offset::Beginning);
            tpl.add_partition_offset(&a.topic, a.partition, offset)?;
        }
        self.consumer.assign(&tpl)?;
        Ok(())
    }
}

#[async_trait]
impl ConsumerConnection for RdKafkaConsumerConnection {
    async fn add_assignment(&self, assignment: &Assignment) -> Result<()> {
        self.assign(assignment)
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let consumer = self.consumer.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            consumer.seek(
                &topic,
                partition,
                Offset::Offset(offset),
                Duration::from_millis(METADATA_TIMEOUT_MS),
            )
        })
        .await
        .map_err(|e| ControllerError::Broker(format!("seek panicked: {}", e)))??;
        Ok(())
    }

    async fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64> {
        let consumer = self.consumer.clone();
        let topic = topic.to_string();
        let (_, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(
                &topic,
                partition,
                Duration::from_millis(METADATA_TIMEOUT_MS),
            )
        })
        .await
        .map_err(|e| ControllerError::Broker(format!("watermark fetch panicked: {}", e)))??;
        Ok(high)
    }

    fn pause(&self) -> Result<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.pause(&assignment)?;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let assignment = self.consumer.assignment()?;
        self.consumer.resume(&assignment)?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.consumer.unassign() {
            debug!("unassign on close failed: {}", e);
        }
    }
}

struct RdKafkaProducerConnection {
    producer: Arc<FutureProducer<EventContext>>,
    delivery_timeout: Duration,
}

#[async_trait]
impl ProducerConnection for RdKafkaProducerConnection {
    async fn produce(&self, record: &OutboundRecord) -> Result<i64> {
        let mut future_record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&record.topic)
            .partition(record.partition)
            .payload(&record.payload[..]);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        let (_, offset) = self
            .producer
            .send(future_record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(err, _)| ControllerError::PublishFailed {
                topic: record.topic.clone(),
                partition: record.partition,
                error: err.to_string(),
            })?;

        Ok(offset)
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("producer flush on close failed: {}", e),
            Err(e) => debug!("producer flush on close panicked: {}", e),
        }
    }
}
