// Configuration module for kafka_controller
//
// Settings come from environment variables. The broker and offset-store
// coordinates are required; timing knobs have defaults matching the observed
// behavior of the deployment (5s reconnect delay, 2s handler cooldown, 3s
// request timeout).

use std::time::Duration;

use crate::kafka::constants::{
    DEFAULT_CLIENT_ID, DEFAULT_DB_PORT, DEFAULT_DELIVERY_TIMEOUT_MS, DEFAULT_HANDLER_COOLDOWN_MS,
    DEFAULT_HOST, DEFAULT_KAFKA_PORT, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    ENV_CLIENT_ID, ENV_DB_HOST, ENV_DB_NAME, ENV_DB_PASS, ENV_DB_PORT, ENV_DB_USER,
    ENV_HANDLER_COOLDOWN_MS, ENV_KAFKA_HOST, ENV_KAFKA_PORT, ENV_LOG_HANDLER_ERRORS,
    ENV_MAX_HANDLER_ATTEMPTS, ENV_RECONNECT_DELAY_MS, ENV_REQUEST_TIMEOUT_MS,
    MAX_RECONNECT_DELAY_MS, MIN_RECONNECT_DELAY_MS, REQUEST_RESPONSE_PARTITION,
    REQUEST_RESPONSE_TOPIC, REQUIRED_ENV,
};
use crate::kafka::error::{ControllerError, Result};

/// Configuration struct holding all controller settings
#[derive(Clone)]
pub struct ControllerConfig {
    pub kafka_host: String,
    pub kafka_port: u16,
    /// Client id reported to the broker
    pub client_id: String,

    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    /// Fixed delay before any dropped connection is rebuilt
    pub reconnect_delay: Duration,
    /// Pause after a request/response handler failure before it is retried
    pub handler_cooldown: Duration,
    /// Response wait used when a request does not specify one
    pub request_timeout: Duration,
    /// Per-record delivery timeout handed to the producer
    pub delivery_timeout: Duration,

    /// Topic carrying request/response traffic
    pub request_topic: String,
    pub request_partition: i32,

    /// Give up on a message after this many failed handler attempts
    ///
    /// `None` retries forever.
    pub max_handler_attempts: Option<u32>,
    /// Log handler failures at warn level instead of debug
    pub log_handler_errors: bool,
}

/// Custom Debug implementation that redacts the database password
impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("kafka_host", &self.kafka_host)
            .field("kafka_port", &self.kafka_port)
            .field("client_id", &self.client_id)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"[REDACTED]")
            .field("reconnect_delay", &self.reconnect_delay)
            .field("handler_cooldown", &self.handler_cooldown)
            .field("request_timeout", &self.request_timeout)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("request_topic", &self.request_topic)
            .field("request_partition", &self.request_partition)
            .field("max_handler_attempts", &self.max_handler_attempts)
            .field("log_handler_errors", &self.log_handler_errors)
            .finish()
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kafka_host: DEFAULT_HOST.to_string(),
            kafka_port: DEFAULT_KAFKA_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            db_host: DEFAULT_HOST.to_string(),
            db_port: DEFAULT_DB_PORT,
            db_name: "kafka".to_string(),
            db_user: "postgres".to_string(),
            db_password: String::new(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            handler_cooldown: Duration::from_millis(DEFAULT_HANDLER_COOLDOWN_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            request_topic: REQUEST_RESPONSE_TOPIC.to_string(),
            request_partition: REQUEST_RESPONSE_PARTITION,
            max_handler_attempts: None,
            log_handler_errors: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let missing: Vec<&str> = REQUIRED_ENV
            .iter()
            .copied()
            .filter(|name| lookup(name).map_or(true, |v| v.is_empty()))
            .collect();
        if !missing.is_empty() {
            // Name every required variable, not just the missing ones
            return Err(ControllerError::MissingEnvironment(
                REQUIRED_ENV.iter().map(|s| s.to_string()).collect(),
            ));
        }

        let required = |name: &str| lookup(name).unwrap_or_default();
        let defaults = Self::default();

        let config = Self {
            kafka_host: required(ENV_KAFKA_HOST),
            kafka_port: parse_var(ENV_KAFKA_PORT, &required(ENV_KAFKA_PORT))?,
            client_id: lookup(ENV_CLIENT_ID).unwrap_or(defaults.client_id),
            db_host: required(ENV_DB_HOST),
            db_port: parse_var(ENV_DB_PORT, &required(ENV_DB_PORT))?,
            db_name: required(ENV_DB_NAME),
            db_user: required(ENV_DB_USER),
            db_password: required(ENV_DB_PASS),
            reconnect_delay: optional_millis(&lookup, ENV_RECONNECT_DELAY_MS)?
                .unwrap_or(defaults.reconnect_delay),
            handler_cooldown: optional_millis(&lookup, ENV_HANDLER_COOLDOWN_MS)?
                .unwrap_or(defaults.handler_cooldown),
            request_timeout: optional_millis(&lookup, ENV_REQUEST_TIMEOUT_MS)?
                .unwrap_or(defaults.request_timeout),
            delivery_timeout: defaults.delivery_timeout,
            request_topic: defaults.request_topic,
            request_partition: defaults.request_partition,
            max_handler_attempts: lookup(ENV_MAX_HANDLER_ATTEMPTS)
                .map(|v| parse_var(ENV_MAX_HANDLER_ATTEMPTS, &v))
                .transpose()?,
            log_handler_errors: lookup(ENV_LOG_HANDLER_ERRORS)
                .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the controller misbehave
    pub fn validate(&self) -> Result<()> {
        if self.kafka_host.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "kafka host is empty".to_string(),
            ));
        }
        if self.db_host.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "database host is empty".to_string(),
            ));
        }
        if self.kafka_port == 0 || self.db_port == 0 {
            return Err(ControllerError::InvalidConfig(
                "ports must be non-zero".to_string(),
            ));
        }

        let delay_ms = self.reconnect_delay.as_millis() as u64;
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&delay_ms) {
            return Err(ControllerError::InvalidConfig(format!(
                "reconnect delay {}ms outside {}..={}ms",
                delay_ms, MIN_RECONNECT_DELAY_MS, MAX_RECONNECT_DELAY_MS
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "request timeout must be positive".to_string(),
            ));
        }
        if self.handler_cooldown.is_zero() || self.delivery_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "handler cooldown and delivery timeout must be positive".to_string(),
            ));
        }
        if self.max_handler_attempts == Some(0) {
            return Err(ControllerError::InvalidConfig(
                "max handler attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Broker list in `host:port` form
    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.kafka_host, self.kafka_port)
    }

    /// Connection settings for the offset store
    pub fn postgres_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.db_host)
            .port(self.db_port)
            .dbname(&self.db_name)
            .user(&self.db_user)
            .password(&self.db_password)
            .application_name(&self.client_id);
        pg
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ControllerError::InvalidConfig(format!("{} has invalid value '{}'", name, value)))
}

fn optional_millis<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| parse_var::<u64>(name, &v).map(Duration::from_millis))
        .transpose()
}
