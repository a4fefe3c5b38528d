//! Controller error types
//!
//! A single error enum covers every failure the controller can surface. The
//! `kind()` classification mirrors how each failure is recovered: transport
//! and persistence errors are healed by rebuilding the affected connection,
//! while timeouts and strict-mode publish failures reach the caller.

use thiserror::Error;

/// Errors that can occur inside the controller
#[derive(Error, Debug)]
pub enum ControllerError {
    /// One or more required environment variables are not set
    #[error("kafka-controller requires that the following environment variables are set: {}", .0.join(", "))]
    MissingEnvironment(Vec<String>),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Strict publish attempted while the producer connection is not ready
    #[error("Producer not connected, refusing strict publish to {topic}[{partition}]")]
    NotConnected { topic: String, partition: i32 },

    /// The broker rejected or failed to acknowledge a publish
    #[error("Failed to publish to {topic}[{partition}]: {error}")]
    PublishFailed {
        topic: String,
        partition: i32,
        error: String,
    },

    /// No response arrived for a request before its deadline
    #[error("Request {key} timed out after {timeout_ms}ms")]
    RequestTimedOut { key: String, timeout_ms: u64 },

    /// Connection-level failure reported by the broker client
    #[error("Broker error: {0}")]
    Broker(String),

    /// Offset store failure
    #[error("Offset store error: {0}")]
    Store(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Application handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// The controller is shutting down
    #[error("Controller is shutting down")]
    Shutdown,
}

/// Recovery class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection close/error, recovered by reconnecting
    Transport,
    /// Offset store failure, fatal to the affected registration
    Persistence,
    /// Application logic failure, retried
    Handler,
    /// Request/response deadline exceeded
    Timeout,
    /// Strict publish failure
    Publish,
    /// Configuration problem
    Config,
    /// Everything else
    Internal,
}

impl ControllerError {
    /// Classify this error by how the controller recovers from it
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Broker(_) => ErrorKind::Transport,
            ControllerError::Store(_) => ErrorKind::Persistence,
            ControllerError::Handler(_) => ErrorKind::Handler,
            ControllerError::RequestTimedOut { .. } => ErrorKind::Timeout,
            ControllerError::NotConnected { .. } | ControllerError::PublishFailed { .. } => {
                ErrorKind::Publish
            }
            ControllerError::MissingEnvironment(_) | ControllerError::InvalidConfig(_) => {
                ErrorKind::Config
            }
            ControllerError::Serialization(_) | ControllerError::Shutdown => ErrorKind::Internal,
        }
    }

    /// Whether the caller of a public operation ever sees this error
    ///
    /// Only timeouts and strict publish failures are caller-visible; every
    /// other class is retried behind the scenes.
    pub fn is_caller_visible(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Publish)
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Error type returned by application-supplied handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

impl From<rdkafka::error::KafkaError> for ControllerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        ControllerError::Broker(err.to_string())
    }
}

impl From<tokio_postgres::Error> for ControllerError {
    fn from(err: tokio_postgres::Error) -> Self {
        ControllerError::Store(err.to_string())
    }
}
