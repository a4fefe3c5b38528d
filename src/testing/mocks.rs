//! In-memory broker and offset store
//!
//! `MockBroker` keeps one append-only log per (topic, partition). Consumer
//! connections run a feeder task that delivers every record past each
//! assigned position, so tests observe the same event-stream shape the
//! rdkafka client produces. Failure injection covers the cases the
//! controller must survive: connects that error before becoming ready,
//! failed produce calls, consumer connects that fail outright and live
//! connections dropping.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

use crate::kafka::client::{
    BrokerClient, ConnectionEvent, ConsumerConnection, EventSink, EventStream, ProducerConnection,
};
use crate::kafka::error::{ControllerError, Result};
use crate::kafka::messages::{Assignment, MessageValue, OutboundRecord, RawMessage, TopicPartition};
use crate::kafka::storage::OffsetStore;

/// Decrement a failure budget, returning whether a failure should be injected
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    payload: Bytes,
}

struct BrokerInner {
    logs: Mutex<HashMap<TopicPartition, Vec<StoredRecord>>>,
    /// Bumped on every append so idle feeders wake up
    appended: watch::Sender<u64>,
    failing_producer_connects: AtomicU32,
    failing_produces: AtomicU32,
    failing_consumer_connects: AtomicU32,
    consumer_sinks: Mutex<Vec<EventSink>>,
    producer_sinks: Mutex<Vec<EventSink>>,
    consumer_connects: AtomicU32,
    producer_connects: AtomicU32,
    /// Stamp delivered messages with the partition's current watermark
    report_high_water: AtomicBool,
    /// Consumer feeders deliver nothing while set
    held: AtomicBool,
}

/// In-memory partitioned log implementing BrokerClient
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                logs: Mutex::new(HashMap::new()),
                appended,
                failing_producer_connects: AtomicU32::new(0),
                failing_produces: AtomicU32::new(0),
                failing_consumer_connects: AtomicU32::new(0),
                consumer_sinks: Mutex::new(Vec::new()),
                producer_sinks: Mutex::new(Vec::new()),
                consumer_connects: AtomicU32::new(0),
                producer_connects: AtomicU32::new(0),
                report_high_water: AtomicBool::new(true),
                held: AtomicBool::new(false),
            }),
        }
    }

    /// Next `n` producer connections report an error instead of becoming ready
    pub fn fail_next_producer_connects(&self, n: u32) {
        self.inner.failing_producer_connects.store(n, Ordering::Release);
    }

    /// Next `n` produce calls fail
    pub fn fail_next_produces(&self, n: u32) {
        self.inner.failing_produces.store(n, Ordering::Release);
    }

    /// Next `n` consumer connect calls fail outright
    pub fn fail_next_consumer_connects(&self, n: u32) {
        self.inner.failing_consumer_connects.store(n, Ordering::Release);
    }

    /// Report an error on every live consumer connection
    pub fn disconnect_consumers(&self) {
        for sink in self.inner.consumer_sinks.lock().drain(..) {
            let _ = sink.send(ConnectionEvent::Error("injected disconnect".to_string()));
        }
    }

    /// Report an error on every live producer connection
    pub fn disconnect_producers(&self) {
        for sink in self.inner.producer_sinks.lock().drain(..) {
            let _ = sink.send(ConnectionEvent::Error("injected disconnect".to_string()));
        }
    }

    /// Deliver messages without a watermark, the way librdkafka does
    pub fn omit_high_water(&self) {
        self.inner.report_high_water.store(false, Ordering::Release);
    }

    /// Stop (or restart) delivery on every consumer connection
    pub fn hold_deliveries(&self, held: bool) {
        self.inner.held.store(held, Ordering::Release);
        if !held {
            self.inner.appended.send_modify(|v| *v += 1);
        }
    }

    pub fn consumer_connects(&self) -> u32 {
        self.inner.consumer_connects.load(Ordering::Acquire)
    }

    pub fn producer_connects(&self) -> u32 {
        self.inner.producer_connects.load(Ordering::Acquire)
    }

    /// Append a JSON value directly to a partition, bypassing any producer
    pub fn publish(&self, topic: &str, partition: i32, value: &Value) -> i64 {
        self.append(&OutboundRecord::new(topic, Some(partition), None, value))
    }

    /// Append raw bytes directly to a partition
    pub fn publish_raw(&self, topic: &str, partition: i32, payload: &[u8]) -> i64 {
        self.append(&OutboundRecord {
            topic: topic.to_string(),
            partition,
            key: None,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Values currently stored in a partition, parsed the way consumers see them
    pub fn records(&self, topic: &str, partition: i32) -> Vec<MessageValue> {
        self.inner
            .logs
            .lock()
            .get(&TopicPartition::new(topic, partition))
            .map(|log| {
                log.iter()
                    .map(|r| MessageValue::parse(Some(&r.payload)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record_count(&self, topic: &str, partition: i32) -> usize {
        self.inner
            .logs
            .lock()
            .get(&TopicPartition::new(topic, partition))
            .map_or(0, Vec::len)
    }

    fn append(&self, record: &OutboundRecord) -> i64 {
        let offset = {
            let mut logs = self.inner.logs.lock();
            let log = logs
                .entry(TopicPartition::new(record.topic.clone(), record.partition))
                .or_default();
            log.push(StoredRecord {
                key: record.key.clone().map(Bytes::from),
                payload: record.payload.clone(),
            });
            (log.len() - 1) as i64
        };
        self.inner.appended.send_modify(|v| *v += 1);
        offset
    }

    fn high_watermark(&self, tp: &TopicPartition) -> i64 {
        self.inner.logs.lock().get(tp).map_or(0, |log| log.len() as i64)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect_consumer(
        &self,
        _group: Option<&str>,
        assignments: &[Assignment],
    ) -> Result<(Arc<dyn ConsumerConnection>, EventStream)> {
        self.inner.consumer_connects.fetch_add(1, Ordering::AcqRel);
        if take_failure(&self.inner.failing_consumer_connects) {
            return Err(ControllerError::Broker("injected connect failure".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(FeedState {
            positions: Mutex::new(
                assignments
                    .iter()
                    .map(|a| (a.topic_partition(), a.offset.unwrap_or(0)))
                    .collect(),
            ),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        });

        let _ = events_tx.send(ConnectionEvent::Ready);
        self.inner.consumer_sinks.lock().push(events_tx.clone());
        tokio::spawn(feed(self.clone(), shared.clone(), events_tx));

        let connection = MockConsumerConnection {
            broker: self.clone(),
            shared,
        };
        Ok((Arc::new(connection), events_rx))
    }

    async fn connect_producer(&self) -> Result<(Arc<dyn ProducerConnection>, EventStream)> {
        self.inner.producer_connects.fetch_add(1, Ordering::AcqRel);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        if take_failure(&self.inner.failing_producer_connects) {
            let _ = events_tx.send(ConnectionEvent::Error(
                "injected connect failure".to_string(),
            ));
        } else {
            let _ = events_tx.send(ConnectionEvent::Ready);
            self.inner.producer_sinks.lock().push(events_tx);
        }

        let connection = MockProducerConnection {
            broker: self.clone(),
        };
        Ok((Arc::new(connection), events_rx))
    }
}

struct FeedState {
    positions: Mutex<BTreeMap<TopicPartition, i64>>,
    paused: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
}

/// Deliver every available record, returning `None` once the receiver is gone
fn deliver_available(broker: &MockBroker, state: &FeedState, events: &EventSink) -> Option<bool> {
    let mut positions = state.positions.lock();
    let logs = broker.inner.logs.lock();
    let mut delivered = false;
    let report_high_water = broker.inner.report_high_water.load(Ordering::Acquire);

    for (tp, position) in positions.iter_mut() {
        let Some(log) = logs.get(tp) else { continue };
        while *position >= 0 && (*position as usize) < log.len() {
            let record = &log[*position as usize];
            let raw = RawMessage {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: *position,
                key: record.key.clone(),
                payload: Some(record.payload.clone()),
                high_water_offset: report_high_water.then_some(log.len() as i64),
            };
            events.send(ConnectionEvent::Message(raw)).ok()?;
            *position += 1;
            delivered = true;
        }
    }
    Some(delivered)
}

async fn feed(broker: MockBroker, state: Arc<FeedState>, events: EventSink) {
    let mut appended = broker.inner.appended.subscribe();
    loop {
        if state.closed.load(Ordering::Acquire) {
            return;
        }
        if !state.paused.load(Ordering::Acquire) && !broker.inner.held.load(Ordering::Acquire) {
            match deliver_available(&broker, &state, &events) {
                None => return,
                Some(true) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Some(false) => {}
            }
        }
        tokio::select! {
            _ = state.wake.notified() => {}
            changed = appended.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

struct MockConsumerConnection {
    broker: MockBroker,
    shared: Arc<FeedState>,
}

#[async_trait]
impl ConsumerConnection for MockConsumerConnection {
    async fn add_assignment(&self, assignment: &Assignment) -> Result<()> {
        self.shared
            .positions
            .lock()
            .insert(assignment.topic_partition(), assignment.offset.unwrap_or(0));
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let tp = TopicPartition::new(topic, partition);
        let mut positions = self.shared.positions.lock();
        match positions.get_mut(&tp) {
            Some(position) => *position = offset,
            None => return Err(ControllerError::Broker(format!("{} is not assigned", tp))),
        }
        drop(positions);
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64> {
        Ok(self
            .broker
            .high_watermark(&TopicPartition::new(topic, partition)))
    }

    fn pause(&self) -> Result<()> {
        self.shared.paused.store(true, Ordering::Release);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

struct MockProducerConnection {
    broker: MockBroker,
}

#[async_trait]
impl ProducerConnection for MockProducerConnection {
    async fn produce(&self, record: &OutboundRecord) -> Result<i64> {
        tokio::task::yield_now().await;
        if take_failure(&self.broker.inner.failing_produces) {
            return Err(ControllerError::PublishFailed {
                topic: record.topic.clone(),
                partition: record.partition,
                error: "injected produce failure".to_string(),
            });
        }
        Ok(self.broker.append(record))
    }

    async fn close(&self) {}
}

type OffsetKey = (String, String, i32);

/// HashMap-backed OffsetStore with failure injection
#[derive(Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<HashMap<OffsetKey, i64>>,
    /// Every successful set_offset, in order
    history: Mutex<Vec<(OffsetKey, i64)>>,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a committed offset
    pub fn with_offset(self, group: &str, topic: &str, partition: i32, offset: i64) -> Self {
        self.offsets
            .lock()
            .insert((group.to_string(), topic.to_string(), partition), offset);
        self
    }

    /// Next `n` get_offset calls fail
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::Release);
    }

    /// Next `n` set_offset calls fail
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::Release);
    }

    pub fn offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Offsets written for one partition, in write order
    pub fn checkpoints(&self, group: &str, topic: &str, partition: i32) -> Vec<i64> {
        let key = (group.to_string(), topic.to_string(), partition);
        self.history
            .lock()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get_offset(&self, group: &str, topic: &str, partition: i32) -> Result<Option<i64>> {
        if take_failure(&self.failing_reads) {
            return Err(ControllerError::Store("injected read failure".to_string()));
        }
        Ok(self.offset(group, topic, partition))
    }

    async fn create_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<()> {
        let key = (group.to_string(), topic.to_string(), partition);
        let mut offsets = self.offsets.lock();
        if offsets.contains_key(&key) {
            return Err(ControllerError::Store(format!(
                "duplicate offset row for {}/{}[{}]",
                group, topic, partition
            )));
        }
        offsets.insert(key, offset);
        Ok(())
    }

    async fn set_offset(&self, group: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        if take_failure(&self.failing_writes) {
            return Err(ControllerError::Store("injected write failure".to_string()));
        }
        let key = (group.to_string(), topic.to_string(), partition);
        let mut offsets = self.offsets.lock();
        match offsets.get_mut(&key) {
            Some(stored) => *stored = offset,
            None => {
                return Err(ControllerError::Store(format!(
                    "no offset row for {}/{}[{}]",
                    group, topic, partition
                )))
            }
        }
        self.history.lock().push((key, offset));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_consumer_receives_from_assigned_offset() {
        let broker = MockBroker::new();
        for n in 0..4 {
            broker.publish("events", 0, &json!({ "n": n }));
        }

        let (_conn, mut events) = broker
            .connect_consumer(Some("g"), &[Assignment::at("events", 0, 2)])
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(ConnectionEvent::Ready)));
        let Some(ConnectionEvent::Message(first)) = events.recv().await else {
            panic!("expected message");
        };
        assert_eq!(first.offset, 2);
        assert_eq!(first.high_water_offset, Some(4));
    }

    #[tokio::test]
    async fn test_failed_producer_connect_reports_error() {
        let broker = MockBroker::new();
        broker.fail_next_producer_connects(1);

        let (_conn, mut events) = broker.connect_producer().await.unwrap();
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Error(_))));

        let (_conn, mut events) = broker.connect_producer().await.unwrap();
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Ready)));
        assert_eq!(broker.producer_connects(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_failure_budget() {
        let store = MemoryOffsetStore::new();
        store.create_offset("g", "t", 0, 0).await.unwrap();
        store.fail_next_writes(1);

        assert!(store.set_offset("g", "t", 0, 1).await.is_err());
        store.set_offset("g", "t", 0, 1).await.unwrap();
        assert_eq!(store.offset("g", "t", 0), Some(1));
        assert_eq!(store.checkpoints("g", "t", 0), vec![1]);
    }
}
