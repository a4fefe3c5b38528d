// Controller context object
//
// KafkaController owns every role's supervisor task (the producer, the search
// scanner and one per consumer registration) together with the broker client
// and offset store they share. Application code holds the controller and
// passes it explicitly to anything built on top of it, such as
// RequestResponse. Dropping or shutting down the controller cancels all of
// its tasks.

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::{BrokerClient, RdKafkaBroker};
use super::consumer::{ConsumerEngine, ConsumerHandle, MessageHandler, RetryPolicy};
use super::error::{ControllerError, Result};
use super::lifecycle::ConnectionLifecycle;
use super::messages::{Message, OutboundRecord, TopicPartition};
use super::producer::{BufferedProducer, SendOutcome};
use super::search::{SearchOptions, SearchScanner};
use super::storage::{OffsetStore, PostgresOffsetStore};
use crate::config::ControllerConfig;

/// Resilient front end over a broker client and an offset store
pub struct KafkaController {
    config: Arc<ControllerConfig>,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn OffsetStore>,
    producer: BufferedProducer,
    scanner: SearchScanner,
    registrations: Mutex<Vec<ConsumerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl KafkaController {
    /// Build a controller from the process environment
    pub async fn from_env() -> Result<Self> {
        Self::connect(ControllerConfig::from_env()?).await
    }

    /// Connect to Kafka (via librdkafka) and PostgreSQL
    ///
    /// Creates the offset table if it does not exist yet.
    pub async fn connect(config: ControllerConfig) -> Result<Self> {
        config.validate()?;

        let store = PostgresOffsetStore::connect(config.postgres_config()).await?;
        store.ensure_schema().await?;
        let broker = RdKafkaBroker::new(Arc::new(config.clone()));

        info!(
            bootstrap = %config.bootstrap_servers(),
            client_id = %config.client_id,
            "kafka controller starting"
        );
        Ok(Self::new(config, Arc::new(broker), Arc::new(store)))
    }

    /// Build a controller over explicit collaborators
    ///
    /// Must be called inside a tokio runtime: the producer and search
    /// scanner start connecting immediately.
    pub fn new(
        config: ControllerConfig,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let (producer, producer_task) = BufferedProducer::spawn(
            broker.clone(),
            ConnectionLifecycle::new("producer", config.reconnect_delay),
            cancel.child_token(),
        );
        let (scanner, scanner_task) = SearchScanner::spawn(
            broker.clone(),
            ConnectionLifecycle::new("search", config.reconnect_delay),
            cancel.child_token(),
        );

        Self {
            config,
            broker,
            store,
            producer,
            scanner,
            registrations: Mutex::new(Vec::new()),
            tasks: Mutex::new(vec![producer_task, scanner_task]),
            cancel,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn producer(&self) -> &BufferedProducer {
        &self.producer
    }

    pub fn scanner(&self) -> &SearchScanner {
        &self.scanner
    }

    pub fn is_producer_ready(&self) -> bool {
        self.producer.is_ready()
    }

    /// Handles of every consumer registered so far
    pub fn registrations(&self) -> Vec<ConsumerHandle> {
        self.registrations.lock().clone()
    }

    /// Consume `topics` as `group`, handing each message to `handler` in order
    ///
    /// Each partition resumes from the group's stored offset (0 when none is
    /// stored). The registration runs until the controller shuts down.
    pub fn register_consumer(
        &self,
        group: &str,
        topics: Vec<TopicPartition>,
        handler: impl MessageHandler,
    ) -> Result<ConsumerHandle> {
        if self.cancel.is_cancelled() {
            return Err(ControllerError::Shutdown);
        }
        if topics.is_empty() {
            return Err(ControllerError::InvalidConfig(format!(
                "consumer group {} registered without topics",
                group
            )));
        }

        let policy = RetryPolicy {
            max_attempts: self.config.max_handler_attempts,
            log_errors: self.config.log_handler_errors,
        };
        let (engine, handle) = ConsumerEngine::new(
            self.broker.clone(),
            self.store.clone(),
            group.to_string(),
            topics,
            Arc::new(handler),
            ConnectionLifecycle::new(format!("consumer:{}", group), self.config.reconnect_delay),
            policy,
            self.cancel.child_token(),
        );

        info!(group, topics = ?handle.topics(), "consumer registered");
        self.tasks.lock().push(tokio::spawn(engine.run()));
        self.registrations.lock().push(handle.clone());
        Ok(handle)
    }

    /// Publish `value` to `topic`
    ///
    /// Non-strict publishes are buffered while the producer is disconnected;
    /// strict publishes fail instead. String values are sent verbatim, any
    /// other value as JSON.
    pub async fn produce_message(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&str>,
        value: &Value,
        strict: bool,
    ) -> Result<SendOutcome> {
        let record = OutboundRecord::new(topic, partition, key.map(str::to_string), value);
        self.producer.send(record, strict).await
    }

    /// Scan `topic[partition]` from `from_offset` for matching events
    pub async fn search_events(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
        options: &SearchOptions,
    ) -> Result<Vec<Message>> {
        self.scanner
            .search(topic, partition, from_offset, options)
            .await
    }

    /// Stop every role and wait for its connection to close
    pub async fn shutdown(&self) {
        info!("kafka controller shutting down");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for outcome in join_all(tasks).await {
            if let Err(e) = outcome {
                warn!("controller task ended abnormally: {}", e);
            }
        }
        info!("kafka controller stopped");
    }
}

impl Drop for KafkaController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
