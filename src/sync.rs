// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offset-sync records and their binary codec.
//!
//! An [`OffsetSync`] pins one `(upstream, downstream)` offset pair for a
//! source topic-partition. Syncs are published to a compacted, single-
//! partition topic: the record *key* encodes only the topic-partition, so
//! log compaction retains exactly the latest sync per partition. The record
//! *value* re-encodes the topic-partition alongside both offsets, so a
//! reader never has to assume key/value pairing.
//!
//! # Wire Layout
//!
//! ```text
//! key:   [topic len: u16][topic bytes][partition: i32]
//! value: [topic len: u16][topic bytes][partition: i32][upstream: i64][downstream: i64]
//! ```
//!
//! All integers are big-endian. Decoding reads from the value alone and
//! tolerates trailing bytes, so fields can be appended later without
//! breaking old readers. The key layout must stay byte-stable across
//! restarts: compaction keys partitions by exact key bytes.

use crate::error::{MirrorError, Result};
use bytes::{Buf, BufMut};
use std::fmt;

/// One log shard: `(topic, partition-index)`.
///
/// Equality is structural; used as a map key throughout the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
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
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A single offset sync: pins `(upstream, downstream)` for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetSync {
    pub topic_partition: TopicPartition,
    pub upstream_offset: i64,
    pub downstream_offset: i64,
}

impl OffsetSync {
    pub fn new(topic_partition: TopicPartition, upstream_offset: i64, downstream_offset: i64) -> Self {
        Self {
            topic_partition,
            upstream_offset,
            downstream_offset,
        }
    }

    /// The sync used for partitions with no recorded sync yet.
    ///
    /// With offsets `(-1, -1)` translation degenerates to the identity
    /// mapping, which is the correct answer when the target partition was
    /// populated from offset 0.
    pub fn sentinel(topic_partition: TopicPartition) -> Self {
        Self::new(topic_partition, -1, -1)
    }

    /// Encode the compaction key: a stable byte string for the partition.
    pub fn encode_key(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.topic_partition.topic.len());
        put_topic_partition(&mut buf, &self.topic_partition);
        buf
    }

    /// Encode the self-describing value payload.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(22 + self.topic_partition.topic.len());
        put_topic_partition(&mut buf, &self.topic_partition);
        buf.put_i64(self.upstream_offset);
        buf.put_i64(self.downstream_offset);
        buf
    }

    /// Decode a sync from a record fetched off the offset-syncs topic.
    ///
    /// Decodes from the value alone (it carries the partition redundantly);
    /// the key is accepted for symmetry but not consulted. Trailing bytes
    /// after the known fields are ignored.
    pub fn decode_record(_key: &[u8], value: &[u8]) -> Result<Self> {
        let mut cursor = value;
        let topic_partition = take_topic_partition(&mut cursor)?;
        if cursor.remaining() < 16 {
            return Err(MirrorError::Codec(format!(
                "offset sync value truncated: {} bytes left for offsets",
                cursor.remaining()
            )));
        }
        let upstream_offset = cursor.get_i64();
        let downstream_offset = cursor.get_i64();
        Ok(Self {
            topic_partition,
            upstream_offset,
            downstream_offset,
        })
    }
}

impl fmt::Display for OffsetSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OffsetSync{{{}: {}=={}}}",
            self.topic_partition, self.upstream_offset, self.downstream_offset
        )
    }
}

fn put_topic_partition(buf: &mut Vec<u8>, tp: &TopicPartition) {
    // Topic names are bounded well below u16::MAX by every cluster we talk to.
    buf.put_u16(tp.topic.len() as u16);
    buf.put_slice(tp.topic.as_bytes());
    buf.put_i32(tp.partition);
}

fn take_topic_partition(cursor: &mut &[u8]) -> Result<TopicPartition> {
    if cursor.remaining() < 2 {
        return Err(MirrorError::Codec("offset sync truncated: no topic length".to_string()));
    }
    let topic_len = cursor.get_u16() as usize;
    if cursor.remaining() < topic_len + 4 {
        return Err(MirrorError::Codec(format!(
            "offset sync truncated: expected {} topic bytes + partition",
            topic_len
        )));
    }
    let mut topic_bytes = vec![0u8; topic_len];
    cursor.copy_to_slice(&mut topic_bytes);
    let topic = String::from_utf8(topic_bytes)
        .map_err(|e| MirrorError::Codec(format!("topic is not valid UTF-8: {}", e)))?;
    let partition = cursor.get_i32();
    Ok(TopicPartition { topic, partition })
}
