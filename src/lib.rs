//! Resilient Kafka front end
//!
//! `kafka_controller` turns a best-effort broker client into a dependable
//! surface:
//!
//! - per-registration sequential consumption, checkpointed to PostgreSQL
//!   after every successful handler call
//! - a producer that buffers while disconnected and never silently drops an
//!   accepted message
//! - request/response calls over a shared topic
//! - filtered read-back of historical events on a live partition
//!
//! Everything hangs off a [`KafkaController`]:
//!
//! ```no_run
//! use kafka_controller::{KafkaController, TopicPartition, handler_fn};
//!
//! # async fn run() -> kafka_controller::Result<()> {
//! let controller = KafkaController::from_env().await?;
//! controller.register_consumer(
//!     "billing",
//!     vec![TopicPartition::new("orders", 0)],
//!     handler_fn(|message| async move {
//!         println!("order at offset {}", message.offset);
//!         Ok(())
//!     }),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! Logging goes through `tracing`; installing a subscriber is up to the
//! application.

pub mod config; // Configuration (environment variables)
pub mod kafka; // Controller, roles and broker/store adapters

// Test utilities (only compiled in test builds)
#[cfg(test)]
pub mod testing;

pub use config::ControllerConfig;
pub use kafka::{
    handler_fn, request_handler_fn, Condition, ConnectionState, ConsumerHandle, ControllerError,
    ErrorKind, HandlerError, IncomingRequest, KafkaController, Message, MessageHandler,
    MessageValue, RequestHandler, RequestResponse, Result, SearchOptions, SendOutcome,
    TopicPartition,
};
