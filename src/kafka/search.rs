// Filtered search scanner
//
// One long-lived consumer connection serves every search. It sits paused
// between searches. A search attaches its (topic, partition) the first time
// it is seen, or seeks an already-attached pair to the requested offset,
// then resumes the connection and evaluates each delivered message against
// the filter and break conditions until one termination rule fires:
//
// - every break condition holds,
// - the requested event count is reached (only without break conditions),
// - the message is the newest in the partition as of the search's start.
//
// Attachments are cumulative. They are carried into every rebuilt connection
// and never retracted. Concurrent searches are serialized: only one search
// owns the delivery slot at a time, and a caller that drops its search future
// frees the slot.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::client::{BrokerClient, ConnectionEvent, ConsumerConnection, EventStream};
use super::error::{ControllerError, Result};
use super::filter::{all_match, Condition};
use super::lifecycle::{ConnectionLifecycle, ConnectionState, LifecycleEvent};
use super::messages::{Assignment, Message, RawMessage, TopicPartition};

/// Filters and termination rules for one search
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Every filter must hold for a message to be included
    pub filters: Vec<Condition>,
    /// The search stops at the first message for which all of these hold
    pub break_conditions: Vec<Condition>,
    /// Stop after this many matches; ignored when break conditions are set
    pub event_count: Option<usize>,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    pub fn break_on(mut self, condition: Condition) -> Self {
        self.break_conditions.push(condition);
        self
    }

    pub fn limit(mut self, event_count: usize) -> Self {
        self.event_count = Some(event_count);
        self
    }

    /// Add `message` to `results` if it matches; returns whether to stop
    fn accept(&self, message: Message, results: &mut Vec<Message>) -> bool {
        let at_high_water = message.is_at_high_water();
        let stop_on_break = !self.break_conditions.is_empty()
            && all_match(&self.break_conditions, &message.value);

        if all_match(&self.filters, &message.value) {
            results.push(message);
        }

        if !self.break_conditions.is_empty() {
            if stop_on_break {
                return true;
            }
        } else if let Some(limit) = self.event_count {
            if results.len() >= limit {
                return true;
            }
        }
        at_high_water
    }
}

enum Command {
    Begin {
        search: u64,
        tp: TopicPartition,
        from_offset: i64,
        results: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<Result<Begun>>,
    },
    End {
        search: u64,
    },
}

enum Begun {
    Started,
    /// Nothing at or past the requested offset
    Empty,
}

struct ScannerShared {
    lifecycle: ConnectionLifecycle,
    commands: mpsc::UnboundedSender<Command>,
    /// Attached pairs and the offset each was last positioned at
    attached: Mutex<BTreeMap<TopicPartition, i64>>,
    search_slot: tokio::sync::Mutex<()>,
    next_search: AtomicU64,
    cancel: CancellationToken,
}

/// Sends `End` for a search when its future finishes or is dropped
struct SlotGuard<'a> {
    search: u64,
    commands: &'a mpsc::UnboundedSender<Command>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::End {
            search: self.search,
        });
    }
}

/// On-demand scanner over historical events
#[derive(Clone)]
pub struct SearchScanner {
    shared: Arc<ScannerShared>,
}

impl SearchScanner {
    /// Start the scanner's supervisor task
    pub fn spawn(
        broker: Arc<dyn BrokerClient>,
        lifecycle: ConnectionLifecycle,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ScannerShared {
            lifecycle,
            commands: commands_tx,
            attached: Mutex::new(BTreeMap::new()),
            search_slot: tokio::sync::Mutex::new(()),
            next_search: AtomicU64::new(1),
            cancel: cancel.clone(),
        });

        let supervisor = ScannerSupervisor {
            shared: shared.clone(),
            broker,
            commands: commands_rx,
            active: None,
            cancel,
        };
        let task = tokio::spawn(supervisor.run());
        (Self { shared }, task)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    /// Pairs the scanner has attached to so far
    pub fn attached(&self) -> Vec<TopicPartition> {
        self.shared.attached.lock().keys().cloned().collect()
    }

    /// Scan `topic[partition]` from `from_offset`, returning matching events
    /// in offset order
    ///
    /// Calls are serialized. If the scanner connection drops mid-search the
    /// call stays pending and restarts from `from_offset` once the
    /// connection is back; callers wanting a bound must apply their own
    /// timeout.
    pub async fn search(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
        options: &SearchOptions,
    ) -> Result<Vec<Message>> {
        if options.break_conditions.is_empty() && options.event_count == Some(0) {
            return Ok(Vec::new());
        }

        let _slot = self.shared.search_slot.lock().await;
        let tp = TopicPartition::new(topic, partition);

        'attempt: loop {
            if !self.shared.lifecycle.wait_ready(&self.shared.cancel).await {
                return Err(ControllerError::Shutdown);
            }

            let search = self.shared.next_search.fetch_add(1, Ordering::Relaxed);
            let (results_tx, mut results_rx) = mpsc::unbounded_channel();
            let (reply_tx, reply_rx) = oneshot::channel();
            self.shared
                .commands
                .send(Command::Begin {
                    search,
                    tp: tp.clone(),
                    from_offset,
                    results: results_tx,
                    reply: reply_tx,
                })
                .map_err(|_| ControllerError::Shutdown)?;
            let _guard = SlotGuard {
                search,
                commands: &self.shared.commands,
            };

            match reply_rx.await {
                Err(_) => return Err(ControllerError::Shutdown),
                Ok(Err(e)) => {
                    debug!(%tp, "search could not start, retrying after reconnect: {}", e);
                    continue 'attempt;
                }
                Ok(Ok(Begun::Empty)) => {
                    debug!(%tp, from_offset, "search range is empty");
                    return Ok(Vec::new());
                }
                Ok(Ok(Begun::Started)) => {}
            }

            let mut results = Vec::new();
            loop {
                let next = tokio::select! {
                    _ = self.shared.cancel.cancelled() => return Err(ControllerError::Shutdown),
                    next = results_rx.recv() => next,
                };
                let Some(message) = next else {
                    warn!(%tp, from_offset, "scanner connection lost mid-search, restarting");
                    continue 'attempt;
                };
                if options.accept(message, &mut results) {
                    debug!(%tp, from_offset, matched = results.len(), "search finished");
                    return Ok(results);
                }
            }
        }
    }
}

/// The search currently owning the delivery slot
struct ActiveSearch {
    search: u64,
    tp: TopicPartition,
    next_offset: i64,
    /// Watermark fetched when the search began; the search ends there
    high_water: i64,
    results: mpsc::UnboundedSender<Message>,
}

enum Teardown {
    Lost(String),
    Shutdown,
}

struct ScannerSupervisor {
    shared: Arc<ScannerShared>,
    broker: Arc<dyn BrokerClient>,
    commands: mpsc::UnboundedReceiver<Command>,
    active: Option<ActiveSearch>,
    cancel: CancellationToken,
}

impl ScannerSupervisor {
    fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.shared.lifecycle
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.lifecycle().apply(LifecycleEvent::Connect);

            let assignments: Vec<Assignment> = self
                .shared
                .attached
                .lock()
                .iter()
                .map(|(tp, offset)| Assignment::at(tp.topic.clone(), tp.partition, *offset))
                .collect();

            let teardown = match self.broker.connect_consumer(None, &assignments).await {
                Ok((connection, mut events)) => {
                    let teardown = self.serve(&connection, &mut events).await;
                    // Dropping the sender ends the active search's stream
                    self.active = None;
                    drop(events);
                    match &teardown {
                        Teardown::Shutdown => {
                            self.lifecycle().apply(LifecycleEvent::Close);
                            connection.close().await;
                            self.lifecycle().apply(LifecycleEvent::Closed);
                        }
                        Teardown::Lost(_) => {
                            self.lifecycle().apply(LifecycleEvent::Lost);
                            connection.close().await;
                        }
                    }
                    teardown
                }
                Err(e) => {
                    self.lifecycle().apply(LifecycleEvent::Lost);
                    Teardown::Lost(e.to_string())
                }
            };

            match teardown {
                Teardown::Shutdown => break,
                Teardown::Lost(reason) => {
                    warn!(
                        "search connection lost, reconnecting in {:?}: {}",
                        self.lifecycle().reconnect_delay(),
                        reason
                    );
                    if !self.lifecycle().backoff(&self.cancel).await {
                        break;
                    }
                }
            }
        }
        debug!("search supervisor finished");
    }

    async fn serve(
        &mut self,
        connection: &Arc<dyn ConsumerConnection>,
        events: &mut EventStream,
    ) -> Teardown {
        loop {
            let ready = self.lifecycle().is_ready();
            tokio::select! {
                _ = self.cancel.cancelled() => return Teardown::Shutdown,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Ready) => {
                        if self.lifecycle().apply(LifecycleEvent::Ready) {
                            if let Err(e) = connection.pause() {
                                return Teardown::Lost(format!("pause failed: {}", e));
                            }
                        }
                    }
                    Some(ConnectionEvent::Message(raw)) => self.forward(connection, raw),
                    Some(ConnectionEvent::Closed) | None => {
                        return Teardown::Lost("connection closed".to_string());
                    }
                    Some(ConnectionEvent::Error(e)) => return Teardown::Lost(e),
                },
                Some(command) = self.commands.recv(), if ready => match command {
                    Command::Begin { search, tp, from_offset, results, reply } => {
                        match self.begin(connection, events, search, tp, from_offset, results).await {
                            Ok(begun) => {
                                let _ = reply.send(Ok(begun));
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                let _ = reply.send(Err(e));
                                return Teardown::Lost(reason);
                            }
                        }
                    }
                    Command::End { search } => self.end(connection, search),
                },
            }
        }
    }

    /// Position the connection for a new search and hand it the slot
    async fn begin(
        &mut self,
        connection: &Arc<dyn ConsumerConnection>,
        events: &mut EventStream,
        search: u64,
        tp: TopicPartition,
        from_offset: i64,
        results: mpsc::UnboundedSender<Message>,
    ) -> Result<Begun> {
        let known = self.shared.attached.lock().contains_key(&tp);
        if known {
            connection.seek(&tp.topic, tp.partition, from_offset).await?;
        } else {
            connection
                .add_assignment(&Assignment::at(tp.topic.clone(), tp.partition, from_offset))
                .await?;
            debug!(%tp, "search attached");
        }
        self.shared.attached.lock().insert(tp.clone(), from_offset);

        let high_water = connection.high_watermark(&tp.topic, tp.partition).await?;
        if from_offset >= high_water {
            return Ok(Begun::Empty);
        }

        // Anything already queued was fetched before the reposition
        loop {
            match events.try_recv() {
                Ok(ConnectionEvent::Message(_)) | Ok(ConnectionEvent::Ready) => {}
                Ok(ConnectionEvent::Closed) => {
                    return Err(ControllerError::Broker("connection closed".to_string()))
                }
                Ok(ConnectionEvent::Error(e)) => return Err(ControllerError::Broker(e)),
                Err(_) => break,
            }
        }

        self.active = Some(ActiveSearch {
            search,
            tp,
            next_offset: from_offset,
            high_water,
            results,
        });
        connection.resume()?;
        Ok(Begun::Started)
    }

    fn end(&mut self, connection: &Arc<dyn ConsumerConnection>, search: u64) {
        if self.active.as_ref().is_some_and(|a| a.search == search) {
            self.active = None;
        }
        if self.active.is_none() {
            if let Err(e) = connection.pause() {
                warn!("failed to pause search connection: {}", e);
            }
        }
    }

    fn forward(&mut self, connection: &Arc<dyn ConsumerConnection>, raw: RawMessage) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if raw.topic != active.tp.topic
            || raw.partition != active.tp.partition
            || raw.offset < active.next_offset
        {
            trace!(topic = %raw.topic, partition = raw.partition, offset = raw.offset, "ignoring message outside active search");
            return;
        }
        active.next_offset = raw.offset + 1;
        let mut message = Message::from_raw(raw);
        message.high_water_offset = Some(active.high_water);
        if active.results.send(message).is_err() {
            // Search went away without ending its slot yet
            let search = active.search;
            self.end(connection, search);
        }
    }
}
