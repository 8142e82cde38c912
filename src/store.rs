// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offset-sync store and offset translation.
//!
//! Tails the compacted offset-syncs topic and keeps the most recent
//! [`OffsetSync`] per source partition. A sibling checkpoint task calls
//! [`translate_downstream`](OffsetSyncStore::translate_downstream) to map
//! source offsets onto target offsets by linear extrapolation from the
//! nearest earlier sync.
//!
//! # Cold Start
//!
//! The consumer always starts from the earliest retained record, so every
//! process start replays the whole (compacted) sync log. Until that
//! catch-up read completes, translation answers may be stale: recent
//! upstream positions can come back as `-1` even though a sync exists on
//! the topic. Callers should treat the first moments after startup
//! accordingly.
//!
//! # Concurrency
//!
//! `update` calls are serialized by an async mutex around the consumer;
//! `translate_downstream` does no I/O and reads the sync map under a short
//! read lock, so it stays callable while an `update` poll is in flight.
//! `close` moves the consumer teardown onto a detached task: a slow broker
//! close must not stall the caller's shutdown path.

use crate::client::{FetchedRecord, LogConsumer, EARLIEST_OFFSET};
use crate::error::{MirrorError, Result};
use crate::metrics;
use crate::sync::{OffsetSync, TopicPartition};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{trace, warn};

/// Returned by `translate_downstream` when the queried offset is older than
/// the oldest sync we have; we refuse to guess.
pub const NOT_TRANSLATABLE: i64 = -1;

const CONSUMER_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Tails the offset-syncs topic and serves translation queries.
pub struct OffsetSyncStore<C: LogConsumer> {
    consumer: Arc<Mutex<Option<C>>>,
    syncs: RwLock<HashMap<TopicPartition, OffsetSync>>,
}

impl<C: LogConsumer> OffsetSyncStore<C> {
    /// Create a store tailing `(offset_syncs_topic, partition 0)` from the
    /// earliest retained record.
    pub fn new(consumer: C, offset_syncs_topic: &str) -> Result<Self> {
        consumer.assign(&[(TopicPartition::new(offset_syncs_topic, 0), EARLIEST_OFFSET)])?;
        Ok(Self {
            consumer: Arc::new(Mutex::new(Some(consumer))),
            syncs: RwLock::new(HashMap::new()),
        })
    }

    /// Poll the syncs topic for up to `poll_timeout` and fold every fetched
    /// record into the store.
    ///
    /// Concurrent calls are serialized. After [`close`](Self::close) this
    /// fails with [`MirrorError::Shutdown`].
    pub async fn update(&self, poll_timeout: Duration) -> Result<()> {
        let guard = self.consumer.lock().await;
        let consumer = guard.as_ref().ok_or(MirrorError::Shutdown)?;
        let records = consumer.poll(poll_timeout).await?;
        for record in &records {
            self.handle_record(record);
        }
        Ok(())
    }

    /// Translate a source offset to a target offset for `topic_partition`.
    ///
    /// Returns [`NOT_TRANSLATABLE`] when `upstream_offset` precedes the
    /// oldest sync held for the partition. With no sync at all the sentinel
    /// `(-1, -1)` applies and translation is the identity mapping.
    pub fn translate_downstream(&self, topic_partition: &TopicPartition, upstream_offset: i64) -> i64 {
        let sync = self.latest_sync(topic_partition);
        if sync.upstream_offset > upstream_offset {
            // Offset is too far in the past to translate accurately
            metrics::record_translation(false);
            return NOT_TRANSLATABLE;
        }
        metrics::record_translation(true);
        let upstream_step = upstream_offset - sync.upstream_offset;
        sync.downstream_offset + upstream_step
    }

    /// Schedule the consumer's shutdown off the caller's thread and return
    /// immediately.
    ///
    /// Subsequent `update` calls fail with [`MirrorError::Shutdown`];
    /// `translate_downstream` keeps serving the pre-close snapshot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn close(&self) {
        let consumer = Arc::clone(&self.consumer);
        tokio::spawn(async move {
            let mut guard = consumer.lock().await;
            if let Some(consumer) = guard.take() {
                if let Err(e) = consumer.close(CONSUMER_CLOSE_TIMEOUT).await {
                    warn!(error = %e, "Failure closing offset-sync consumer");
                }
            }
        });
    }

    /// Number of partitions with a recorded sync.
    pub fn len(&self) -> usize {
        read_lock(&self.syncs).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.syncs).is_empty()
    }

    fn handle_record(&self, record: &FetchedRecord) {
        let key = record.key.as_deref().unwrap_or_default();
        let Some(value) = record.value.as_deref() else {
            warn!(offset = record.offset, "Offset sync record has no value, skipping");
            return;
        };
        match OffsetSync::decode_record(key, value) {
            Ok(sync) => {
                trace!(sync = %sync, "Applied offset sync");
                metrics::record_sync_applied(&sync.topic_partition);
                let mut syncs = write_lock(&self.syncs);
                syncs.insert(sync.topic_partition.clone(), sync);
            }
            Err(e) => {
                warn!(offset = record.offset, error = %e, "Skipping malformed offset sync record");
            }
        }
    }

    fn latest_sync(&self, topic_partition: &TopicPartition) -> OffsetSync {
        read_lock(&self.syncs)
            .get(topic_partition)
            .cloned()
            .unwrap_or_else(|| OffsetSync::sentinel(topic_partition.clone()))
    }
}

// Lock poisoning only happens if a holder panicked; the map is always left
// consistent between operations, so continuing with the inner value is safe.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted consumer over pre-encoded sync records.
    struct ScriptedSyncLog {
        batches: StdMutex<VecDeque<Vec<FetchedRecord>>>,
        assigned: StdMutex<Vec<(TopicPartition, i64)>>,
        close_calls: AtomicUsize,
    }

    impl ScriptedSyncLog {
        fn new(batches: Vec<Vec<FetchedRecord>>) -> Self {
            Self {
                batches: StdMutex::new(batches.into_iter().collect()),
                assigned: StdMutex::new(Vec::new()),
                close_calls: AtomicUsize::new(0),
            }
        }
    }

    impl LogConsumer for Arc<ScriptedSyncLog> {
        fn assign(&self, positions: &[(TopicPartition, i64)]) -> Result<()> {
            self.assigned.lock().unwrap().extend_from_slice(positions);
            Ok(())
        }

        fn poll(&self, _timeout: Duration) -> BoxFuture<'_, Vec<FetchedRecord>> {
            let batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
            Box::pin(async move { Ok(batch) })
        }

        fn close(&self, _timeout: Duration) -> BoxFuture<'_, ()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(()) })
        }
    }

    fn sync_record(topic: &str, partition: i32, upstream: i64, downstream: i64, offset: i64) -> FetchedRecord {
        let sync = OffsetSync::new(TopicPartition::new(topic, partition), upstream, downstream);
        FetchedRecord {
            topic: "mm2-offset-syncs.backup.internal".to_string(),
            partition: 0,
            offset,
            key: Some(sync.encode_key()),
            value: Some(sync.encode_value()),
            timestamp_ms: 0,
            headers: vec![],
        }
    }

    fn store_with(batches: Vec<Vec<FetchedRecord>>) -> (OffsetSyncStore<Arc<ScriptedSyncLog>>, Arc<ScriptedSyncLog>) {
        let consumer = Arc::new(ScriptedSyncLog::new(batches));
        let store = OffsetSyncStore::new(Arc::clone(&consumer), "mm2-offset-syncs.backup.internal")
            .unwrap();
        (store, consumer)
    }

    #[test]
    fn test_new_assigns_syncs_partition_zero_from_earliest() {
        let (_store, consumer) = store_with(vec![]);
        let assigned = consumer.assigned.lock().unwrap().clone();
        assert_eq!(
            assigned,
            vec![(
                TopicPartition::new("mm2-offset-syncs.backup.internal", 0),
                EARLIEST_OFFSET
            )]
        );
    }

    #[tokio::test]
    async fn test_translation_linear_extrapolation() {
        let tp = TopicPartition::new("events", 0);
        let (store, _) = store_with(vec![vec![sync_record("events", 0, 100, 900, 0)]]);
        store.update(Duration::from_millis(10)).await.unwrap();

        // At the sync point
        assert_eq!(store.translate_downstream(&tp, 100), 900);
        // Ahead of the sync point: extrapolate linearly
        assert_eq!(store.translate_downstream(&tp, 150), 950);
        // Behind the sync point: refuse to guess
        assert_eq!(store.translate_downstream(&tp, 99), NOT_TRANSLATABLE);
    }

    #[tokio::test]
    async fn test_latest_sync_wins() {
        // Publish (100, 900) then (200, 1005); only the latest counts.
        let tp = TopicPartition::new("events", 0);
        let (store, _) = store_with(vec![vec![
            sync_record("events", 0, 100, 900, 0),
            sync_record("events", 0, 200, 1005, 1),
        ]]);
        store.update(Duration::from_millis(10)).await.unwrap();

        assert_eq!(store.translate_downstream(&tp, 50), NOT_TRANSLATABLE);
        assert_eq!(store.translate_downstream(&tp, 250), 1055);
        assert_eq!(store.translate_downstream(&tp, 200), 1005);
        // 150 is now behind the latest sync: no longer translatable
        assert_eq!(store.translate_downstream(&tp, 150), NOT_TRANSLATABLE);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let (store, _) = store_with(vec![vec![
            sync_record("events", 0, 10, 1000, 0),
            sync_record("events", 1, 20, 2000, 1),
            sync_record("orders", 0, 30, 3000, 2),
        ]]);
        store.update(Duration::from_millis(10)).await.unwrap();

        assert_eq!(store.translate_downstream(&TopicPartition::new("events", 0), 15), 1005);
        assert_eq!(store.translate_downstream(&TopicPartition::new("events", 1), 25), 2005);
        assert_eq!(store.translate_downstream(&TopicPartition::new("orders", 0), 30), 3000);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_no_sync_behaves_as_sentinel() {
        let (store, _) = store_with(vec![]);
        let tp = TopicPartition::new("events", 0);
        // Sentinel (-1, -1): identity translation, never "too old"
        assert_eq!(store.translate_downstream(&tp, 0), 0);
        assert_eq!(store.translate_downstream(&tp, 12345), 12345);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_applies_across_multiple_polls() {
        let tp = TopicPartition::new("events", 0);
        let (store, _) = store_with(vec![
            vec![sync_record("events", 0, 10, 1000, 0)],
            vec![sync_record("events", 0, 500, 5000, 1)],
        ]);

        store.update(Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.translate_downstream(&tp, 10), 1000);

        store.update(Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.translate_downstream(&tp, 500), 5000);
        assert_eq!(store.translate_downstream(&tp, 10), NOT_TRANSLATABLE);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let tp = TopicPartition::new("events", 0);
        let good = sync_record("events", 0, 10, 1000, 2);
        let garbage = FetchedRecord {
            topic: "mm2-offset-syncs.backup.internal".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            value: Some(vec![0xDE, 0xAD]),
            timestamp_ms: 0,
            headers: vec![],
        };
        let tombstone = FetchedRecord {
            value: None,
            ..garbage.clone()
        };

        let (store, _) = store_with(vec![vec![garbage, tombstone, good]]);
        store.update(Duration::from_millis(10)).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.translate_downstream(&tp, 10), 1000);
    }

    #[tokio::test]
    async fn test_close_is_off_thread_and_update_fails_after() {
        let (store, consumer) = store_with(vec![vec![sync_record("events", 0, 10, 1000, 0)]]);
        store.update(Duration::from_millis(10)).await.unwrap();

        store.close();
        // Let the detached close task run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumer.close_calls.load(Ordering::SeqCst), 1);

        // update fails cleanly
        let err = store.update(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MirrorError::Shutdown));

        // translation still serves the pre-close snapshot
        let tp = TopicPartition::new("events", 0);
        assert_eq!(store.translate_downstream(&tp, 12), 1002);
    }

    #[tokio::test]
    async fn test_close_twice_closes_consumer_once() {
        let (store, consumer) = store_with(vec![]);
        store.close();
        store.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumer.close_calls.load(Ordering::SeqCst), 1);
    }
}
