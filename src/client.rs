// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seam traits and record types.
//!
//! The pump and the offset-sync store talk to clusters exclusively through
//! [`LogConsumer`] and [`LogProducer`]. The rdkafka-backed implementations
//! live in [`crate::kafka`]; tests substitute mocks. This decouples the
//! replication state machine from the broker protocol and makes every
//! ordering and shutdown property testable without a running cluster.

use crate::error::Result;
use crate::sync::TopicPartition;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Assign-position sentinel: start from the earliest retained record.
pub const EARLIEST_OFFSET: i64 = -1;

/// A record fetched from a source partition, exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Record key; nullable on the wire.
    pub key: Option<Vec<u8>>,
    /// Record value; nullable on the wire (tombstones).
    pub value: Option<Vec<u8>>,
    /// Record timestamp in epoch milliseconds; -1 when the source has none.
    pub timestamp_ms: i64,
    /// Headers in source order, values nullable.
    pub headers: Vec<(String, Option<Vec<u8>>)>,
}

impl FetchedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Value size in bytes; 0 for null values.
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// A record converted for publication onto the target cluster.
///
/// Carries its source coordinates so the commit callback can update
/// partition state once the target acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRecord {
    /// Where the record came from on the source cluster.
    pub source_topic_partition: TopicPartition,
    /// The record's offset in its source partition.
    pub source_offset: i64,
    /// Renamed topic on the target cluster.
    pub topic: String,
    /// Target partition; always equals the source partition.
    pub partition: i32,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp_ms: i64,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
}

impl ForwardedRecord {
    /// The target-side topic-partition this record lands on.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Acknowledgement metadata for a forwarded record, reported by the host
/// once the target cluster has accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    /// The offset the record landed at on the target, when known.
    pub offset: Option<i64>,
}

impl RecordMetadata {
    pub fn with_offset(offset: i64) -> Self {
        Self { offset: Some(offset) }
    }

    /// Some transports acknowledge without a concrete offset; no offset
    /// sync can be derived from such an ack.
    pub fn without_offset() -> Self {
        Self { offset: None }
    }

    pub fn has_offset(&self) -> bool {
        self.offset.is_some()
    }
}

/// A consumer over an assigned set of partitions of one cluster.
///
/// Implementations yield records in source order per assigned partition.
pub trait LogConsumer: Send + Sync + 'static {
    /// Assign partitions with explicit start positions.
    ///
    /// A position of [`EARLIEST_OFFSET`] seeks to the earliest retained
    /// record; any other value seeks to that exact offset.
    fn assign(&self, positions: &[(TopicPartition, i64)]) -> Result<()>;

    /// Fetch the next batch, blocking up to `timeout`.
    ///
    /// An empty batch means the timeout elapsed with nothing to read.
    /// Implementations must be cancellation-safe: the caller may race this
    /// future against a wake signal and drop it mid-flight.
    fn poll(&self, timeout: Duration) -> BoxFuture<'_, Vec<FetchedRecord>>;

    /// Tear down the consumer, bounded by `timeout`.
    fn close(&self, timeout: Duration) -> BoxFuture<'_, ()>;
}

/// A producer onto one cluster.
pub trait LogProducer: Send + Sync + 'static {
    /// Enqueue one record; the returned future resolves with the offset the
    /// record was acknowledged at.
    ///
    /// The future is detached from the producer's lifetime so callers can
    /// hand it to a background task.
    fn send(&self, topic: &str, partition: i32, key: Vec<u8>, value: Vec<u8>)
        -> BoxFuture<'static, i64>;

    /// Flush and tear down the producer, bounded by `timeout`.
    fn close(&self, timeout: Duration) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: Option<Vec<u8>>) -> FetchedRecord {
        FetchedRecord {
            topic: "events".to_string(),
            partition: 2,
            offset: 7,
            key: None,
            value,
            timestamp_ms: 1_700_000_000_000,
            headers: vec![],
        }
    }

    #[test]
    fn test_fetched_record_topic_partition() {
        let tp = record(None).topic_partition();
        assert_eq!(tp, TopicPartition::new("events", 2));
    }

    #[test]
    fn test_fetched_record_value_len() {
        assert_eq!(record(None).value_len(), 0);
        assert_eq!(record(Some(vec![1, 2, 3])).value_len(), 3);
    }

    #[test]
    fn test_record_metadata() {
        let acked = RecordMetadata::with_offset(42);
        assert!(acked.has_offset());
        assert_eq!(acked.offset, Some(42));

        let blind = RecordMetadata::without_offset();
        assert!(!blind.has_offset());
        assert_eq!(blind.offset, None);
    }

    #[test]
    fn test_forwarded_record_topic_partition() {
        let forwarded = ForwardedRecord {
            source_topic_partition: TopicPartition::new("events", 1),
            source_offset: 10,
            topic: "primary.events".to_string(),
            partition: 1,
            key: None,
            value: None,
            timestamp_ms: -1,
            headers: vec![],
        };
        assert_eq!(forwarded.topic_partition(), TopicPartition::new("primary.events", 1));
    }
}
