// Kafka controller module
//
// This module contains everything between application code and the broker:
// - Connection lifecycle state machine shared by every role
// - Sequential, checkpointed consumption with crash-safe resume points
// - Buffered producer that survives reconnects
// - Request/response correlation over a shared topic
// - Filtered search over historical events
//
// Architecture Overview:
// =====================
//
// Every role owns exactly one broker connection and one supervisor task:
//
//   KafkaController
//     ├── BufferedProducer  ──> producer connection
//     ├── SearchScanner     ──> consumer connection (no group offsets)
//     └── ConsumerEngine*   ──> consumer connection + OffsetStore rows
//
// Supervisors talk to the broker only through the BrokerClient trait and to
// persistence only through the OffsetStore trait, so the whole pipeline runs
// unchanged against librdkafka/PostgreSQL in production and against the
// in-memory MockBroker/MemoryOffsetStore in tests.
//
// RequestResponse sits on top: it publishes through the controller's
// producer and reads the shared topic through an ordinary consumer
// registration.

pub mod client;
pub mod constants;
pub mod consumer;
pub mod controller;
pub mod correlator;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod messages;
pub mod producer;
pub mod search;
pub mod storage;


// Re-export commonly used types for convenience
pub use client::{BrokerClient, ConnectionEvent, RdKafkaBroker};
pub use consumer::{handler_fn, ConsumerHandle, MessageHandler};
pub use controller::KafkaController;
pub use correlator::{request_handler_fn, IncomingRequest, RequestHandler, RequestResponse};
pub use error::{ControllerError, ErrorKind, HandlerError, Result};
pub use filter::{Condition, Expression, FieldPath};
pub use lifecycle::ConnectionState;
pub use messages::{Assignment, Message, MessageValue, OutboundRecord, TopicPartition};
pub use producer::SendOutcome;
pub use search::SearchOptions;
pub use storage::{OffsetStore, PostgresOffsetStore};
