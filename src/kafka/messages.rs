// Message types shared by every controller component
//
// This module defines the data model the controller moves around:
// - TopicPartition / Assignment: where in a partition's log a consumer sits
// - RawMessage: what the broker client hands us (bytes only)
// - Message: what application handlers see (value parsed opportunistically)
// - OutboundRecord: what the producer sends
//
// Value parsing is best-effort: a payload that is valid JSON becomes
// MessageValue::Structured, anything else stays MessageValue::Raw. The variant
// itself records whether parsing succeeded.

use bytes::Bytes;
use serde_json::Value;
use std::fmt;

use super::constants::DEFAULT_PARTITION;

/// A single partition of a topic
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A position in a specific partition's log
///
/// `offset` is `None` until the resume point has been read from the offset
/// store. It only moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub topic: String,
    pub partition: i32,
    pub offset: Option<i64>,
}

impl Assignment {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: None,
        }
    }

    pub fn at(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: Some(offset),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl From<TopicPartition> for Assignment {
    fn from(tp: TopicPartition) -> Self {
        Assignment::new(tp.topic, tp.partition)
    }
}

/// A message as delivered by the broker client
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    /// Offset just past the newest record in the partition, when known
    pub high_water_offset: Option<i64>,
}

/// Consumed message value
#[derive(Debug, Clone, PartialEq)]
pub enum MessageValue {
    /// Payload parsed as a JSON document
    Structured(Value),
    /// Payload that is not valid JSON (or absent), kept as bytes
    Raw(Bytes),
}

impl MessageValue {
    /// Parse a payload, falling back to raw bytes when it is not JSON
    pub fn parse(payload: Option<&Bytes>) -> Self {
        match payload {
            Some(bytes) => match serde_json::from_slice::<Value>(bytes) {
                Ok(doc) => MessageValue::Structured(doc),
                Err(_) => MessageValue::Raw(bytes.clone()),
            },
            None => MessageValue::Raw(Bytes::new()),
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            MessageValue::Structured(doc) => Some(doc),
            MessageValue::Raw(_) => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, MessageValue::Structured(_))
    }
}

/// A consumed message, as seen by handlers and search results
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: MessageValue,
    pub high_water_offset: Option<i64>,
}

impl Message {
    pub fn from_raw(raw: RawMessage) -> Self {
        let value = MessageValue::parse(raw.payload.as_ref());
        Self {
            topic: raw.topic,
            partition: raw.partition,
            offset: raw.offset,
            key: raw.key,
            value,
            high_water_offset: raw.high_water_offset,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Key decoded as UTF-8, if present and valid
    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_deref()
            .and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Whether this is the newest record currently in the partition
    pub fn is_at_high_water(&self) -> bool {
        matches!(self.high_water_offset, Some(hwm) if self.offset >= hwm - 1)
    }
}

/// A record waiting to be (or being) published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    pub partition: i32,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl OutboundRecord {
    /// Build a record from a JSON value
    ///
    /// String values are sent verbatim; every other value is serialized.
    pub fn new(
        topic: impl Into<String>,
        partition: Option<i32>,
        key: Option<String>,
        value: &Value,
    ) -> Self {
        let payload = match value {
            Value::String(s) => Bytes::from(s.clone()),
            other => Bytes::from(other.to_string()),
        };
        Self {
            topic: topic.into(),
            partition: partition.unwrap_or(DEFAULT_PARTITION),
            key,
            payload,
        }
    }
}
