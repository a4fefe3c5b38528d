// Broker client abstraction
//
// This module defines the narrow surface the controller needs from a Kafka
// client. By keeping session management, metadata discovery and wire
// encoding behind these traits we achieve:
// 1. Testability - every component runs against the in-memory MockBroker
// 2. Clean separation - reconnect/offset/ordering logic never touches librdkafka
//
// Each connect call returns a handle plus an event stream. The stream carries
// the connection's ready/close/error signals and, for consumers, its
// messages. A connection whose stream ends is treated as closed.

pub mod librdkafka;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::Result;
use super::messages::{Assignment, OutboundRecord, RawMessage};

pub use librdkafka::RdKafkaBroker;

/// Signal emitted by a broker connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection is usable
    Ready,
    /// A consumed message
    Message(RawMessage),
    /// Connection closed by the peer or the client
    Closed,
    /// Connection-level error
    Error(String),
}

/// Receiving side of a connection's event stream
pub type EventStream = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Sending side of a connection's event stream
pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// Factory for broker connections
///
/// One connection is opened per role (each consumer registration, the
/// producer, the search scanner); the roles never share a connection.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Open a consumer connection positioned at the given assignments
    ///
    /// Every assignment passed here carries a resolved offset.
    async fn connect_consumer(
        &self,
        group: Option<&str>,
        assignments: &[Assignment],
    ) -> Result<(Arc<dyn ConsumerConnection>, EventStream)>;

    /// Open a producer connection
    async fn connect_producer(&self) -> Result<(Arc<dyn ProducerConnection>, EventStream)>;
}

/// A live consumer connection
#[async_trait]
pub trait ConsumerConnection: Send + Sync {
    /// Start fetching an additional partition from the given offset
    async fn add_assignment(&self, assignment: &Assignment) -> Result<()>;

    /// Reposition an already-assigned partition
    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Offset just past the newest record currently in the partition
    async fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64>;

    /// Stop delivering messages for every assigned partition
    fn pause(&self) -> Result<()>;

    /// Resume delivering messages for every assigned partition
    fn resume(&self) -> Result<()>;

    /// Close the connection; no events are delivered afterwards
    async fn close(&self);
}

/// A live producer connection
#[async_trait]
pub trait ProducerConnection: Send + Sync {
    /// Publish one record, returning the offset the broker assigned
    async fn produce(&self, record: &OutboundRecord) -> Result<i64>;

    /// Close the connection
    async fn close(&self);
}
