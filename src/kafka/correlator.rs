// Request/response over a shared topic
//
// Callers publish a request envelope carrying a fresh correlation id and
// wait on a oneshot channel registered under that id. Every participant
// consumes the shared topic through an ordinary consumer registration:
// responses complete the matching pending call, and requests addressed to
// the local service (and not yet expired) are handed to the registered
// request handler, whose result is published back as a response.
//
// A pending call ends exactly once: either its response arrives or its
// timeout fires, and whichever comes second finds the entry already gone.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::constants::{
    CORRELATION_ID_ALPHABET, CORRELATION_ID_LENGTH, REQUEST_RESPONSE_KEY, RESERVED_ID_CHARS,
};
use super::consumer::{ConsumerHandle, MessageHandler};
use super::controller::KafkaController;
use super::error::{ControllerError, HandlerError, Result};
use super::messages::{Message, OutboundRecord, TopicPartition};
use super::producer::BufferedProducer;

/// Record exchanged on the request/response topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request {
        target: String,
        key: String,
        task: String,
        /// Absolute deadline, seconds since the Unix epoch
        timeout: f64,
        #[serde(default)]
        data: Value,
    },
    Response {
        key: String,
        #[serde(default)]
        data: Value,
    },
}

/// A request addressed to this service
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub target: String,
    pub key: String,
    pub task: String,
    /// Absolute deadline, seconds since the Unix epoch
    pub deadline: f64,
    pub data: Value,
}

/// Service-side logic answering requests
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: &IncomingRequest) -> std::result::Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a RequestHandler
pub struct FnRequestHandler<F>(F);

/// Wrap an async closure as a RequestHandler
pub fn request_handler_fn<F, Fut>(f: F) -> FnRequestHandler<F>
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    FnRequestHandler(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: &IncomingRequest) -> std::result::Result<Value, HandlerError> {
        (self.0)(request.clone()).await
    }
}

/// Draw a correlation id uniformly from the id alphabet
pub fn generate_correlation_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CORRELATION_ID_LENGTH)
        .map(|_| {
            let i = rng.gen_range(0..CORRELATION_ID_ALPHABET.len());
            CORRELATION_ID_ALPHABET[i] as char
        })
        .collect()
}

/// Ids containing the key-encoding delimiters are never used
pub fn is_usable_id(id: &str) -> bool {
    !id.contains(&RESERVED_ID_CHARS[..])
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Drops a pending call's entry when the call ends
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<Value>>>,
    key: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.key);
    }
}

struct Listener {
    handler: Arc<dyn RequestHandler>,
    service: String,
}

/// Request/response participant bound to one controller
pub struct RequestResponse {
    producer: BufferedProducer,
    topic: String,
    partition: i32,
    default_timeout: Duration,
    cooldown: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    listener: Mutex<Option<Arc<Listener>>>,
    consumer: OnceLock<ConsumerHandle>,
}

impl RequestResponse {
    /// Join the request/response topic as consumer group `group`
    pub fn init(controller: &KafkaController, group: &str) -> Result<Arc<Self>> {
        let config = controller.config();
        let correlator = Arc::new(Self {
            producer: controller.producer().clone(),
            topic: config.request_topic.clone(),
            partition: config.request_partition,
            default_timeout: config.request_timeout,
            cooldown: config.handler_cooldown,
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            consumer: OnceLock::new(),
        });

        let handle = controller.register_consumer(
            group,
            vec![TopicPartition::new(
                correlator.topic.clone(),
                correlator.partition,
            )],
            correlator.clone(),
        )?;
        let _ = correlator.consumer.set(handle);
        Ok(correlator)
    }

    /// The consumer registration reading the shared topic
    pub fn consumer(&self) -> Option<&ConsumerHandle> {
        self.consumer.get()
    }

    /// Answer requests addressed to `service` with `handler`
    ///
    /// Replaces any previously registered listener.
    pub fn register_request_listener(
        &self,
        handler: impl RequestHandler,
        service: impl Into<String>,
    ) {
        let service = service.into();
        debug!(service = %service, "request listener registered");
        *self.listener.lock() = Some(Arc::new(Listener {
            handler: Arc::new(handler),
            service,
        }));
    }

    /// Number of calls still waiting for a response
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `task` to `target` and wait for its response payload
    ///
    /// Fails with `NotConnected`/`PublishFailed` if the request cannot be
    /// published, or `RequestTimedOut` if no response arrives within
    /// `timeout` (default from config).
    pub async fn query_request_response(
        &self,
        target: &str,
        task: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        let key = self.register_pending(tx);
        // Removes the entry however this call ends, including being dropped
        let _pending = PendingGuard {
            pending: &self.pending,
            key: &key,
        };

        let envelope = Envelope::Request {
            target: target.to_string(),
            key: key.clone(),
            task: task.to_string(),
            timeout: epoch_seconds() + timeout.as_secs_f64(),
            data: payload,
        };
        let record = OutboundRecord::new(
            self.topic.clone(),
            Some(self.partition),
            Some(REQUEST_RESPONSE_KEY.to_string()),
            &serde_json::to_value(&envelope)?,
        );

        if let Err(e) = self.producer.send(record, true).await {
            debug!(key = %key, service = %target, task, "could not publish request: {}", e);
            return Err(e);
        }
        trace!(key = %key, service = %target, task, "request published");

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(ControllerError::Shutdown),
            Err(_) => {
                // A response that claimed the entry first still wins
                if self.pending.lock().remove(&key).is_none() {
                    if let Ok(data) = rx.try_recv() {
                        return Ok(data);
                    }
                }
                debug!(key = %key, service = %target, task, "request timed out");
                Err(ControllerError::RequestTimedOut {
                    key: key.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Insert a pending call under a fresh, unreserved, unused id
    fn register_pending(&self, tx: oneshot::Sender<Value>) -> String {
        let mut pending = self.pending.lock();
        let mut rng = rand::thread_rng();
        loop {
            let id = generate_correlation_id(&mut rng);
            if is_usable_id(&id) && !pending.contains_key(&id) {
                pending.insert(id.clone(), tx);
                return id;
            }
        }
    }

    async fn dispatch(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        if message.topic != self.topic {
            return Ok(());
        }
        let Some(document) = message.value.as_structured() else {
            return Ok(());
        };
        let envelope: Envelope = match serde_json::from_value(document.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(offset = message.offset, "not a request/response envelope: {}", e);
                return Ok(());
            }
        };

        match envelope {
            Envelope::Response { key, data } => {
                if let Some(tx) = self.pending.lock().remove(&key) {
                    trace!(key = %key, "response matched pending call");
                    let _ = tx.send(data);
                }
                Ok(())
            }
            Envelope::Request {
                target,
                key,
                task,
                timeout,
                data,
            } => {
                let listener = self.listener.lock().clone();
                let Some(listener) = listener else {
                    return Ok(());
                };
                if target != listener.service {
                    return Ok(());
                }
                if timeout <= epoch_seconds() {
                    trace!(key = %key, task = %task, "ignoring expired request");
                    return Ok(());
                }

                let request = IncomingRequest {
                    target,
                    key,
                    task,
                    deadline: timeout,
                    data,
                };
                let data = listener.handler.handle(&request).await.map_err(|e| {
                    ControllerError::Handler(format!(
                        "listener {} failed on task {}: {}",
                        listener.service, request.task, e
                    ))
                })?;

                let response = serde_json::to_value(Envelope::Response {
                    key: request.key.clone(),
                    data,
                })?;
                let record = OutboundRecord::new(
                    self.topic.clone(),
                    Some(self.partition),
                    Some(REQUEST_RESPONSE_KEY.to_string()),
                    &response,
                );
                self.producer.send(record, true).await?;
                trace!(key = %request.key, task = %request.task, "response published");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RequestResponse {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        if let Err(e) = self.dispatch(message).await {
            warn!(
                offset = message.offset,
                "request/response handling failed, cooling down for {:?}: {}",
                self.cooldown,
                e
            );
            tokio::time::sleep(self.cooldown).await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::constants::REQUEST_RESPONSE_TOPIC;
    use crate::testing::{test_config, wait_until, MemoryOffsetStore, MockBroker};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn controller(broker: &MockBroker) -> (KafkaController, Arc<MemoryOffsetStore>) {
        let store = Arc::new(MemoryOffsetStore::new());
        let controller =
            KafkaController::new(test_config(), Arc::new(broker.clone()), store.clone());
        (controller, store)
    }

    fn requests(broker: &MockBroker) -> Vec<(String, String)> {
        broker
            .records(REQUEST_RESPONSE_TOPIC, 0)
            .iter()
            .filter_map(|v| v.as_structured().cloned())
            .filter_map(|doc| serde_json::from_value::<Envelope>(doc).ok())
            .filter_map(|e| match e {
                Envelope::Request { key, task, .. } => Some((key, task)),
                Envelope::Response { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_envelope_wire_format() {
        let request = Envelope::Request {
            target: "billing".into(),
            key: "abc".into(),
            task: "charge".into(),
            timeout: 12.5,
            data: json!({"amount": 3}),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "request", "target": "billing", "key": "abc",
                   "task": "charge", "timeout": 12.5, "data": {"amount": 3}})
        );

        let response: Envelope =
            serde_json::from_value(json!({"type": "response", "key": "abc"})).unwrap();
        assert_eq!(
            response,
            Envelope::Response {
                key: "abc".into(),
                data: Value::Null
            }
        );
    }

    proptest! {
        #[test]
        fn prop_generated_ids_use_alphabet(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let id = generate_correlation_id(&mut rng);
            prop_assert_eq!(id.len(), CORRELATION_ID_LENGTH);
            prop_assert!(id.bytes().all(|b| CORRELATION_ID_ALPHABET.contains(&b)));
        }

        #[test]
        fn prop_reserved_chars_rejected(prefix in "[a-z0-9]{0,5}", reserved in prop::sample::select(vec!['$', '@'])) {
            let id = format!("{}{}", prefix, reserved);
            prop_assert!(!is_usable_id(&id));
            prop_assert!(is_usable_id(&prefix));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_ids_unique_and_usable() {
        let broker = MockBroker::new();
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "caller").unwrap();

        let mut ids = HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..500 {
            let (tx, rx) = oneshot::channel();
            let id = correlator.register_pending(tx);
            assert!(is_usable_id(&id));
            assert!(ids.insert(id));
            receivers.push(rx);
        }
        assert_eq!(correlator.pending_len(), 500);

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_clears_pending() {
        let broker = MockBroker::new();
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "caller").unwrap();
        assert!(controller.producer().wait_ready(&CancellationToken::new()).await);

        let start = Instant::now();
        let err = correlator
            .query_request_response("nobody", "ping", json!({}), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, ControllerError::RequestTimedOut { timeout_ms: 100, .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(110));
        assert_eq!(correlator.pending_len(), 0);

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_rejects_immediately() {
        let broker = MockBroker::new();
        broker.fail_next_producer_connects(1);
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "caller").unwrap();

        let err = correlator
            .query_request_response("billing", "charge", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NotConnected { .. }));
        assert_eq!(correlator.pending_len(), 0);

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_through_listener() {
        let broker = MockBroker::new();
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "billing").unwrap();
        correlator.register_request_listener(
            request_handler_fn(|request: IncomingRequest| async move {
                let amount = request.data["amount"].as_i64().unwrap_or(0);
                Ok(json!({ "task": request.task, "charged": amount * 2 }))
            }),
            "billing",
        );
        assert!(controller.producer().wait_ready(&CancellationToken::new()).await);

        let response = correlator
            .query_request_response(
                "billing",
                "charge",
                json!({ "amount": 21 }),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(response, json!({ "task": "charge", "charged": 42 }));
        assert_eq!(correlator.pending_len(), 0);

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_responses_routed_by_key() {
        let broker = MockBroker::new();
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "caller").unwrap();
        assert!(controller.producer().wait_ready(&CancellationToken::new()).await);

        let first = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .query_request_response("svc", "first", json!(1), Some(Duration::from_secs(5)))
                    .await
            })
        };
        let second = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .query_request_response("svc", "second", json!(2), Some(Duration::from_secs(5)))
                    .await
            })
        };

        assert!(wait_until(|| requests(&broker).len() == 2, Duration::from_secs(1)).await);
        let sent = requests(&broker);
        assert_ne!(sent[0].0, sent[1].0);

        // Answer in reverse order, echoing each task name
        for (key, task) in sent.iter().rev() {
            broker.publish(
                REQUEST_RESPONSE_TOPIC,
                0,
                &json!({ "type": "response", "key": key, "data": task }),
            );
        }

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_and_foreign_requests_ignored() {
        let broker = MockBroker::new();
        let (controller, store) = controller(&broker);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let correlator = RequestResponse::init(&controller, "billing").unwrap();
        correlator.register_request_listener(
            request_handler_fn(move |_request: IncomingRequest| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("done"))
                }
            }),
            "billing",
        );

        let now = epoch_seconds();
        broker.publish(
            REQUEST_RESPONSE_TOPIC,
            0,
            &json!({"type": "request", "target": "billing", "key": "old", "task": "t",
                    "timeout": now - 10.0, "data": null}),
        );
        broker.publish(
            REQUEST_RESPONSE_TOPIC,
            0,
            &json!({"type": "request", "target": "shipping", "key": "other", "task": "t",
                    "timeout": now + 600.0, "data": null}),
        );
        broker.publish_raw(REQUEST_RESPONSE_TOPIC, 0, b"garbage");

        assert!(wait_until(
            || store.offset("billing", REQUEST_RESPONSE_TOPIC, 0) == Some(3),
            Duration::from_secs(5)
        )
        .await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // No response was published
        assert_eq!(broker.record_count(REQUEST_RESPONSE_TOPIC, 0), 3);

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_listener_cools_down_and_retries() {
        let broker = MockBroker::new();
        let (controller, store) = controller(&broker);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let correlator = RequestResponse::init(&controller, "billing").unwrap();
        correlator.register_request_listener(
            request_handler_fn(move |_request: IncomingRequest| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err::<Value, HandlerError>("first attempt fails".into())
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }),
            "billing",
        );

        broker.publish(
            REQUEST_RESPONSE_TOPIC,
            0,
            &json!({"type": "request", "target": "billing", "key": "k1", "task": "t",
                    "timeout": epoch_seconds() + 600.0, "data": null}),
        );

        assert!(wait_until(
            || store.offset("billing", REQUEST_RESPONSE_TOPIC, 0).map_or(false, |o| o >= 1),
            Duration::from_secs(5)
        )
        .await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(wait_until(
            || broker.record_count(REQUEST_RESPONSE_TOPIC, 0) == 2,
            Duration::from_secs(1)
        )
        .await);

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_failure_reported_as_handler_error() {
        let broker = MockBroker::new();
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "billing").unwrap();
        correlator.register_request_listener(
            request_handler_fn(|_request: IncomingRequest| async {
                Err::<Value, HandlerError>("card declined".into())
            }),
            "billing",
        );

        let offset = broker.publish(
            REQUEST_RESPONSE_TOPIC,
            0,
            &json!({"type": "request", "target": "billing", "key": "k1", "task": "charge",
                    "timeout": epoch_seconds() + 600.0, "data": null}),
        );
        let message = Message {
            topic: REQUEST_RESPONSE_TOPIC.to_string(),
            partition: 0,
            offset,
            key: None,
            value: broker.records(REQUEST_RESPONSE_TOPIC, 0).remove(0),
            high_water_offset: None,
        };

        let err = correlator.dispatch(&message).await.unwrap_err();
        let err = err.downcast_ref::<ControllerError>().unwrap();
        assert!(matches!(err, ControllerError::Handler(_)));
        assert!(err.to_string().contains("card declined"));
        assert!(err.to_string().contains("charge"));

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_clears_pending() {
        let broker = MockBroker::new();
        let (controller, _) = controller(&broker);
        let correlator = RequestResponse::init(&controller, "caller").unwrap();
        assert!(controller.producer().wait_ready(&CancellationToken::new()).await);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            correlator.query_request_response(
                "nobody",
                "ping",
                json!({}),
                Some(Duration::from_millis(100)),
            ),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(correlator.pending_len(), 0);

        controller.shutdown().await;
    }
}
