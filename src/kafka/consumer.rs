// Sequential consumption engine
//
// Each registration owns one consumer connection and one supervisor task.
// The supervisor resolves resume points from the offset store, opens the
// connection, queues every delivered message and feeds the handler one
// message at a time. The offset store is checkpointed only after the handler
// succeeds.
//
// Any failure (connection error, handler error, checkpoint write failure)
// tears the registration down and rebuilds it after the reconnect delay. The
// unprocessed queue, including the message that failed, is carried into the
// rebuilt registration, and broker redeliveries of offsets that were already
// queued are dropped so the carried messages are not handled twice.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::client::{BrokerClient, ConnectionEvent, EventStream};
use super::error::{HandlerError, Result};
use super::lifecycle::{ConnectionLifecycle, ConnectionState, LifecycleEvent};
use super::messages::{Message, TopicPartition};
use super::storage::{resolve_assignments, OffsetStore};

/// Application logic invoked for every consumed message
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Adapter turning an async closure into a MessageHandler
pub struct FnHandler<F>(F);

/// Wrap an async closure as a MessageHandler
///
/// The closure receives an owned copy of each message.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        (self.0)(message.clone()).await
    }
}

/// Handler retry policy shared by every registration of a controller
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    /// Skip a message after this many failed attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Log handler failures at warn instead of debug
    pub log_errors: bool,
}

/// A queued message and the number of handler attempts it has used
#[derive(Debug, Clone)]
struct PendingMessage {
    message: Message,
    attempts: u32,
}

/// State visible through a ConsumerHandle
struct RegistrationShared {
    group: String,
    topics: Vec<TopicPartition>,
    lifecycle: ConnectionLifecycle,
    /// Id of the current incarnation, replaced on every rebuild
    id: Mutex<Uuid>,
}

/// Handle to a registered consumer
#[derive(Clone)]
pub struct ConsumerHandle {
    shared: Arc<RegistrationShared>,
}

impl ConsumerHandle {
    pub fn group(&self) -> &str {
        &self.shared.group
    }

    pub fn topics(&self) -> &[TopicPartition] {
        &self.shared.topics
    }

    /// Id of the registration's current incarnation
    pub fn registration_id(&self) -> Uuid {
        *self.shared.id.lock()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    /// Number of times the registration has connected
    pub fn generation(&self) -> u64 {
        self.shared.lifecycle.generation()
    }

    /// Wait until the registration's connection is ready
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        self.shared.lifecycle.wait_ready(cancel).await
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("group", &self.shared.group)
            .field("topics", &self.shared.topics)
            .field("registration_id", &self.registration_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Why one incarnation of a registration ended
enum Teardown {
    Rebuild(String),
    Shutdown,
}

/// Result of handing one message to the handler
enum Processed {
    Done,
    HandlerFailed(PendingMessage),
    CheckpointFailed(PendingMessage),
    Cancelled(PendingMessage),
}

/// Supervisor for one registration
pub(crate) struct ConsumerEngine {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn OffsetStore>,
    handler: Arc<dyn MessageHandler>,
    shared: Arc<RegistrationShared>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    pending: VecDeque<PendingMessage>,
    /// Per partition, one past the newest offset ever queued
    next_expected: HashMap<TopicPartition, i64>,
}

impl ConsumerEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn OffsetStore>,
        group: String,
        topics: Vec<TopicPartition>,
        handler: Arc<dyn MessageHandler>,
        lifecycle: ConnectionLifecycle,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> (Self, ConsumerHandle) {
        let shared = Arc::new(RegistrationShared {
            group,
            topics,
            lifecycle,
            id: Mutex::new(Uuid::nil()),
        });
        let handle = ConsumerHandle {
            shared: shared.clone(),
        };
        let engine = Self {
            broker,
            store,
            handler,
            shared,
            policy,
            cancel,
            pending: VecDeque::new(),
            next_expected: HashMap::new(),
        };
        (engine, handle)
    }

    fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.shared.lifecycle
    }

    /// Run incarnations until shutdown
    pub(crate) async fn run(mut self) {
        let group = self.shared.group.clone();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Teardown::Shutdown => break,
                Teardown::Rebuild(reason) => {
                    warn!(
                        group = %group,
                        carried = self.pending.len(),
                        "rebuilding consumer registration in {:?}: {}",
                        self.lifecycle().reconnect_delay(),
                        reason
                    );
                    if !self.lifecycle().backoff(&self.cancel).await {
                        break;
                    }
                }
            }
        }
        if !self.pending.is_empty() {
            info!(
                group = %group,
                "consumer stopped with {} unprocessed messages; they will be redelivered on restart",
                self.pending.len()
            );
        }
        debug!(group = %group, "consumer supervisor finished");
    }

    /// One incarnation: resolve offsets, connect, process until torn down
    async fn run_once(&mut self) -> Teardown {
        let id = Uuid::new_v4();
        *self.shared.id.lock() = id;
        self.lifecycle().apply(LifecycleEvent::Connect);

        // Resume points are fixed before the connection exists
        let assignments =
            match resolve_assignments(&*self.store, &self.shared.group, &self.shared.topics).await
            {
                Ok(assignments) => assignments,
                Err(e) => {
                    error!(group = %self.shared.group, registration = %id, "failed to read offsets: {}", e);
                    self.lifecycle().apply(LifecycleEvent::Lost);
                    return Teardown::Rebuild(e.to_string());
                }
            };

        let (connection, mut events) = match self
            .broker
            .connect_consumer(Some(&self.shared.group), &assignments)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.lifecycle().apply(LifecycleEvent::Lost);
                return Teardown::Rebuild(e.to_string());
            }
        };
        debug!(
            group = %self.shared.group,
            registration = %id,
            "consumer connection opened for {:?}",
            assignments
        );

        let teardown = self.pump(&mut events).await;

        // Detach before closing so nothing from the old connection leaks into
        // the next incarnation
        drop(events);
        match &teardown {
            Teardown::Shutdown => {
                self.lifecycle().apply(LifecycleEvent::Close);
                connection.close().await;
                self.lifecycle().apply(LifecycleEvent::Closed);
            }
            Teardown::Rebuild(_) => {
                self.lifecycle().apply(LifecycleEvent::Lost);
                connection.close().await;
            }
        }
        teardown
    }

    /// Queue events and drain the queue one message at a time
    async fn pump(&mut self, events: &mut EventStream) -> Teardown {
        loop {
            // Absorb whatever is already waiting
            loop {
                match events.try_recv() {
                    Ok(event) => {
                        if let Some(teardown) = self.on_event(event) {
                            return teardown;
                        }
                    }
                    Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
                    Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                        return Teardown::Rebuild("event stream ended".to_string());
                    }
                }
            }

            if self.lifecycle().is_ready() {
                if let Some(next) = self.pending.pop_front() {
                    match self.process(next).await {
                        Processed::Done => continue,
                        Processed::HandlerFailed(item) => {
                            self.pending.push_front(item);
                            return Teardown::Rebuild("handler failed".to_string());
                        }
                        Processed::CheckpointFailed(item) => {
                            self.pending.push_front(item);
                            return Teardown::Rebuild("offset checkpoint failed".to_string());
                        }
                        Processed::Cancelled(item) => {
                            self.pending.push_front(item);
                            return Teardown::Shutdown;
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Teardown::Shutdown,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(teardown) = self.on_event(event) {
                            return teardown;
                        }
                    }
                    None => return Teardown::Rebuild("event stream ended".to_string()),
                },
            }
        }
    }

    fn on_event(&mut self, event: ConnectionEvent) -> Option<Teardown> {
        match event {
            ConnectionEvent::Ready => {
                self.lifecycle().apply(LifecycleEvent::Ready);
                None
            }
            ConnectionEvent::Message(raw) => {
                let message = Message::from_raw(raw);
                self.enqueue(message);
                None
            }
            ConnectionEvent::Closed => Some(Teardown::Rebuild("connection closed".to_string())),
            ConnectionEvent::Error(e) => Some(Teardown::Rebuild(format!("connection error: {}", e))),
        }
    }

    /// Append a delivered message unless it was already queued once
    fn enqueue(&mut self, message: Message) {
        let next = self
            .next_expected
            .entry(message.topic_partition())
            .or_insert(i64::MIN);
        if message.offset < *next {
            trace!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "dropping redelivered message"
            );
            return;
        }
        *next = message.offset + 1;
        self.pending.push_back(PendingMessage {
            message,
            attempts: 0,
        });
    }

    async fn process(&self, mut item: PendingMessage) -> Processed {
        item.attempts += 1;

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            outcome = self.handler.handle(&item.message) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            return Processed::Cancelled(item);
        };

        let message = &item.message;
        if let Err(e) = outcome {
            if self.policy.log_errors {
                warn!(
                    group = %self.shared.group,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    attempt = item.attempts,
                    "handler failed: {}",
                    e
                );
            } else {
                debug!(
                    group = %self.shared.group,
                    offset = message.offset,
                    attempt = item.attempts,
                    "handler failed: {}",
                    e
                );
            }

            match self.policy.max_attempts {
                Some(max) if item.attempts >= max => {
                    error!(
                        group = %self.shared.group,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "skipping message after {} failed attempts",
                        item.attempts
                    );
                }
                _ => return Processed::HandlerFailed(item),
            }
        }

        match self.checkpoint(message).await {
            Ok(()) => Processed::Done,
            Err(e) => {
                error!(
                    group = %self.shared.group,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "failed to checkpoint offset: {}",
                    e
                );
                Processed::CheckpointFailed(item)
            }
        }
    }

    async fn checkpoint(&self, message: &Message) -> Result<()> {
        let next = message.offset + 1;
        self.store
            .set_offset(&self.shared.group, &message.topic, message.partition, next)
            .await?;
        trace!(
            group = %self.shared.group,
            topic = %message.topic,
            partition = message.partition,
            offset = next,
            "checkpointed"
        );
        Ok(())
    }
}
