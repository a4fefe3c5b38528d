// Buffered producer
//
// Publish requests are accepted whether or not the producer connection is
// up. A supervisor task owns the connection: it connects, waits for the ready
// signal, drains the buffer strictly FIFO with one record in flight, and
// rebuilds the connection after the reconnect delay whenever it closes, errors
// or fails a send.
//
// The buffer lives in state shared across connection instances, so records
// accepted while disconnected survive any number of reconnects. A buffered
// record is removed only after the broker acknowledges it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::client::{BrokerClient, ConnectionEvent, EventStream, ProducerConnection};
use super::error::{ControllerError, Result};
use super::lifecycle::{ConnectionLifecycle, ConnectionState, LifecycleEvent};
use super::messages::OutboundRecord;

/// Result of an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Acknowledged by the broker at this offset
    Sent { offset: i64 },
    /// Buffered for delivery once the connection is ready
    Queued,
}

impl SendOutcome {
    pub fn offset(&self) -> Option<i64> {
        match self {
            SendOutcome::Sent { offset } => Some(*offset),
            SendOutcome::Queued => None,
        }
    }
}

struct ProducerShared {
    lifecycle: ConnectionLifecycle,
    /// Set only while the lifecycle is Ready
    connection: Mutex<Option<Arc<dyn ProducerConnection>>>,
    buffer: Mutex<VecDeque<OutboundRecord>>,
    buffer_grew: Notify,
    /// Generation of a connection whose direct send failed
    reconnect_requests: mpsc::UnboundedSender<u64>,
}

/// Producer that buffers while disconnected and drains in order once ready
#[derive(Clone)]
pub struct BufferedProducer {
    shared: Arc<ProducerShared>,
}

impl BufferedProducer {
    /// Start the producer's supervisor task
    pub fn spawn(
        broker: Arc<dyn BrokerClient>,
        lifecycle: ConnectionLifecycle,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ProducerShared {
            lifecycle,
            connection: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
            buffer_grew: Notify::new(),
            reconnect_requests: reconnect_tx,
        });

        let supervisor = ProducerSupervisor {
            shared: shared.clone(),
            broker,
            reconnect_requests: reconnect_rx,
            cancel,
        };
        let task = tokio::spawn(supervisor.run());
        (Self { shared }, task)
    }

    /// Publish one record
    ///
    /// - Ready, nothing buffered: sent directly; failure is returned and the
    ///   connection is rebuilt.
    /// - Ready, buffer still draining: non-strict records join the back of
    ///   the buffer, strict records are sent directly.
    /// - Not ready: non-strict records are buffered and reported as
    ///   `Queued`; strict records fail with `NotConnected`.
    pub async fn send(&self, record: OutboundRecord, strict: bool) -> Result<SendOutcome> {
        let connection = if self.shared.lifecycle.is_ready() {
            self.shared.connection.lock().clone()
        } else {
            None
        };

        let Some(connection) = connection else {
            if strict {
                return Err(ControllerError::NotConnected {
                    topic: record.topic,
                    partition: record.partition,
                });
            }
            self.enqueue(record);
            return Ok(SendOutcome::Queued);
        };

        if !strict {
            let mut buffer = self.shared.buffer.lock();
            if !buffer.is_empty() {
                buffer.push_back(record);
                drop(buffer);
                self.shared.buffer_grew.notify_one();
                return Ok(SendOutcome::Queued);
            }
        }

        let generation = self.shared.lifecycle.generation();
        match connection.produce(&record).await {
            Ok(offset) => {
                trace!(topic = %record.topic, partition = record.partition, offset, "sent");
                Ok(SendOutcome::Sent { offset })
            }
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    "direct send failed, requesting producer reconnect: {}",
                    e
                );
                let _ = self.shared.reconnect_requests.send(generation);
                Err(e)
            }
        }
    }

    fn enqueue(&self, record: OutboundRecord) {
        let len = {
            let mut buffer = self.shared.buffer.lock();
            buffer.push_back(record);
            buffer.len()
        };
        debug!(buffered = len, "producer not ready, buffered record");
        self.shared.buffer_grew.notify_one();
    }

    /// Records accepted but not yet acknowledged
    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lifecycle.is_ready()
    }

    /// Wait until the producer connection is ready
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        self.shared.lifecycle.wait_ready(cancel).await
    }
}

enum Teardown {
    Lost(String),
    Shutdown,
}

struct ProducerSupervisor {
    shared: Arc<ProducerShared>,
    broker: Arc<dyn BrokerClient>,
    reconnect_requests: mpsc::UnboundedReceiver<u64>,
    cancel: CancellationToken,
}

impl ProducerSupervisor {
    fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.shared.lifecycle
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.lifecycle().apply(LifecycleEvent::Connect);

            let teardown = match self.broker.connect_producer().await {
                Ok((connection, mut events)) => {
                    let teardown = self.serve(&connection, &mut events).await;
                    *self.shared.connection.lock() = None;
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
                        buffered = self.shared.buffer.lock().len(),
                        "producer connection lost, reconnecting in {:?}: {}",
                        self.lifecycle().reconnect_delay(),
                        reason
                    );
                    if !self.lifecycle().backoff(&self.cancel).await {
                        break;
                    }
                }
            }
        }

        let unsent = self.shared.buffer.lock().len();
        if unsent > 0 {
            warn!("producer stopped with {} buffered records never sent", unsent);
        }
        debug!("producer supervisor finished");
    }

    /// Handle one connection instance until it is torn down
    async fn serve(
        &mut self,
        connection: &Arc<dyn ProducerConnection>,
        events: &mut EventStream,
    ) -> Teardown {
        loop {
            if self.lifecycle().is_ready() {
                let head = self.shared.buffer.lock().front().cloned();
                if let Some(record) = head {
                    // The record stays at the front until acknowledged
                    let sent = tokio::select! {
                        _ = self.cancel.cancelled() => return Teardown::Shutdown,
                        sent = connection.produce(&record) => sent,
                    };
                    match sent {
                        Ok(offset) => {
                            let remaining = {
                                let mut buffer = self.shared.buffer.lock();
                                buffer.pop_front();
                                buffer.len()
                            };
                            trace!(topic = %record.topic, offset, remaining, "drained buffered record");
                            continue;
                        }
                        Err(e) => return Teardown::Lost(format!("buffered send failed: {}", e)),
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Teardown::Shutdown,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Ready) => {
                        if self.lifecycle().apply(LifecycleEvent::Ready) {
                            *self.shared.connection.lock() = Some(connection.clone());
                            info!(
                                buffered = self.shared.buffer.lock().len(),
                                "producer ready"
                            );
                        }
                    }
                    Some(ConnectionEvent::Message(_)) => {}
                    Some(ConnectionEvent::Closed) | None => {
                        return Teardown::Lost("connection closed".to_string());
                    }
                    Some(ConnectionEvent::Error(e)) => return Teardown::Lost(e),
                },
                Some(generation) = self.reconnect_requests.recv() => {
                    if generation == self.lifecycle().generation() {
                        return Teardown::Lost("direct send failed".to_string());
                    }
                }
                _ = self.shared.buffer_grew.notified() => {}
            }
        }
    }
}
