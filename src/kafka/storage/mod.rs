// Offset store abstraction for kafka_controller
//
// This module defines the OffsetStore trait that abstracts where committed
// consumer positions live. Keeping persistence behind a trait gives us:
// 1. Testability - the consumption engine runs against MemoryOffsetStore
// 2. Clean separation - the engine never builds SQL
//
// Rows are keyed by (group, topic, partition). Independent keys never need
// cross-row coordination, so any store with row-level atomicity is safe to
// share between concurrently running registrations.

pub mod postgres;


use async_trait::async_trait;
use tracing::debug;

use super::constants::INITIAL_OFFSET;
use super::error::Result;
use super::messages::{Assignment, TopicPartition};

pub use postgres::PostgresOffsetStore;

/// Persisted store of committed consumer offsets
///
/// Every failure is reported as an error that the consumption engine treats
/// as fatal to the affected registration.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    /// Read the committed offset, `None` if no row exists yet
    async fn get_offset(&self, group: &str, topic: &str, partition: i32) -> Result<Option<i64>>;

    /// Insert a new row
    async fn create_offset(&self, group: &str, topic: &str, partition: i32, offset: i64)
        -> Result<()>;

    /// Update an existing row
    async fn set_offset(&self, group: &str, topic: &str, partition: i32, offset: i64)
        -> Result<()>;
}

/// Read the resume point for one partition, initializing it if absent
///
/// A (group, topic, partition) seen for the first time gets a row at
/// offset 0 and starts from the beginning of the log.
pub async fn resume_offset(
    store: &dyn OffsetStore,
    group: &str,
    topic: &str,
    partition: i32,
) -> Result<i64> {
    match store.get_offset(group, topic, partition).await? {
        Some(offset) => {
            debug!(group, topic, partition, offset, "resuming from stored offset");
            Ok(offset)
        }
        None => {
            store
                .create_offset(group, topic, partition, INITIAL_OFFSET)
                .await?;
            debug!(group, topic, partition, "initialized offset row");
            Ok(INITIAL_OFFSET)
        }
    }
}

/// Resolve resume points for every partition of a registration
///
/// Runs before the consumer connection exists, so no message can arrive
/// ahead of its resume point.
pub async fn resolve_assignments(
    store: &dyn OffsetStore,
    group: &str,
    topics: &[TopicPartition],
) -> Result<Vec<Assignment>> {
    let mut assignments = Vec::with_capacity(topics.len());
    for tp in topics {
        let offset = resume_offset(store, group, &tp.topic, tp.partition).await?;
        assignments.push(Assignment::at(tp.topic.clone(), tp.partition, offset));
    }
    Ok(assignments)
}
