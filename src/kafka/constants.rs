//! Controller constants
//!
//! This module centralizes the magic numbers used by the controller: reconnect
//! delays, the request/response topic, correlation id alphabet and the
//! environment variable names read by the configuration layer.

// ===== Reconnection =====

/// Default delay before a dropped connection is rebuilt (milliseconds)
///
/// The delay is fixed; there is no exponential growth between attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Minimum reconnect delay accepted by config validation (milliseconds)
pub const MIN_RECONNECT_DELAY_MS: u64 = 1;

/// Maximum reconnect delay accepted by config validation (milliseconds)
pub const MAX_RECONNECT_DELAY_MS: u64 = 300_000;

/// Default pause after a request/response handler failure (milliseconds)
///
/// Slows re-delivery of a message whose handler keeps throwing.
pub const DEFAULT_HANDLER_COOLDOWN_MS: u64 = 2000;

// ===== Producer =====

/// Default delivery timeout for a single produce call (milliseconds)
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;

/// Timeout for the metadata fetch that confirms a producer is ready (milliseconds)
pub const METADATA_TIMEOUT_MS: u64 = 10_000;

/// Default partition used when a caller does not pick one
pub const DEFAULT_PARTITION: i32 = 0;

// ===== Request / Response =====

/// Well-known topic shared by every request/response participant
pub const REQUEST_RESPONSE_TOPIC: &str = "apaas-request-response";

/// Partition of the request/response topic
pub const REQUEST_RESPONSE_PARTITION: i32 = 0;

/// Record key used for every request/response publish
pub const REQUEST_RESPONSE_KEY: &str = "0";

/// Default time a caller waits for a response (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Alphabet correlation ids are drawn from
///
/// `$` and `@` are part of the alphabet but are reserved as key-encoding
/// delimiters, so generated ids containing them are discarded.
pub const CORRELATION_ID_ALPHABET: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ$@";

/// Characters a correlation id must never contain
pub const RESERVED_ID_CHARS: [char; 2] = ['$', '@'];

/// Length of a generated correlation id
pub const CORRELATION_ID_LENGTH: usize = 10;

// ===== Offset Store =====

/// Table holding committed offsets, keyed by (groupId, topic, partition)
pub const OFFSET_TABLE: &str = "topic_offset";

/// Offset a fresh (group, topic, partition) starts from
pub const INITIAL_OFFSET: i64 = 0;

// ===== Client Identity =====

/// Default client id reported to the broker
pub const DEFAULT_CLIENT_ID: &str = "kafka-controller";

/// Default Kafka port
pub const DEFAULT_KAFKA_PORT: u16 = 9092;

/// Default PostgreSQL port
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default host for both Kafka and PostgreSQL
pub const DEFAULT_HOST: &str = "localhost";

// ===== Environment Variables =====

pub const ENV_KAFKA_HOST: &str = "KAFKA_HOST";
pub const ENV_KAFKA_PORT: &str = "KAFKA_PORT";
pub const ENV_DB_HOST: &str = "DB_HOST";
pub const ENV_DB_PORT: &str = "DB_PORT";
pub const ENV_DB_NAME: &str = "DB_KAFKA_NAME";
pub const ENV_DB_USER: &str = "DB_USER";
pub const ENV_DB_PASS: &str = "DB_PASS";

/// Variables that must be present for `ControllerConfig::from_env`
pub const REQUIRED_ENV: [&str; 7] = [
    ENV_KAFKA_HOST,
    ENV_KAFKA_PORT,
    ENV_DB_HOST,
    ENV_DB_PORT,
    ENV_DB_NAME,
    ENV_DB_USER,
    ENV_DB_PASS,
];

pub const ENV_CLIENT_ID: &str = "KAFKA_CLIENT_ID";
pub const ENV_RECONNECT_DELAY_MS: &str = "KAFKA_RECONNECT_DELAY_MS";
pub const ENV_HANDLER_COOLDOWN_MS: &str = "KAFKA_HANDLER_COOLDOWN_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "KAFKA_REQUEST_TIMEOUT_MS";
pub const ENV_MAX_HANDLER_ATTEMPTS: &str = "KAFKA_MAX_HANDLER_ATTEMPTS";
pub const ENV_LOG_HANDLER_ERRORS: &str = "LOG_MSG_PROCESSING_ERRORS";
