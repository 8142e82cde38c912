// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication pump.
//!
//! A [`ReplicationTask`] replicates an assigned set of source
//! topic-partitions. The host drives it:
//!
//! 1. [`poll()`](ReplicationTask::poll) fetches a batch from the source and
//!    converts each record for the target (renamed topic, same partition,
//!    raw key/value, carried timestamp, verbatim headers).
//! 2. The host publishes the batch to the target cluster.
//! 3. For each acknowledged record the host calls
//!    [`commit_record()`](ReplicationTask::commit_record), which feeds the
//!    per-partition [`PartitionState`] and emits an offset sync when the
//!    decision rule fires.
//! 4. [`stop()`](ReplicationTask::stop) wakes any in-flight poll and closes
//!    the clients with bounded timeouts.
//!
//! # The Task Lock
//!
//! `poll`, `commit_record` and `stop` serialize on one async mutex. Within a
//! task nothing runs concurrently except offset-sync acknowledgements, which
//! only touch the in-flight semaphore.
//!
//! # Offset-Sync Backpressure
//!
//! At most [`MAX_OUTSTANDING_OFFSET_SYNCS`] sync produces are in flight.
//! When the semaphore is exhausted a qualifying sync is dropped silently:
//! the decision rule re-fires on a later commit, and the compacted topic
//! only ever needs the latest sync per partition.

use crate::client::{
    FetchedRecord, ForwardedRecord, LogConsumer, LogProducer, RecordMetadata, EARLIEST_OFFSET,
};
use crate::config::TaskAssignment;
use crate::error::{MirrorError, Result};
use crate::metrics::{self, TaskMetrics};
use crate::storage::{self, OffsetStorage};
use crate::sync::{OffsetSync, TopicPartition};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on offset-sync produces in flight per task.
pub const MAX_OUTSTANDING_OFFSET_SYNCS: usize = 10;

/// Bounded timeout for closing each client during shutdown.
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of a replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Task is being constructed; clients not yet seeded.
    Created,
    /// Polling and replicating.
    Running,
    /// `stop()` called; clients are closing.
    Stopping,
    /// Shut down. No further pump iterations or sync emissions occur.
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "Created"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Stopping => write!(f, "Stopping"),
            TaskState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Per-partition decision state: should we emit an offset sync now?
///
/// Tracks the last observed `(upstream, downstream)` pair and the pair of
/// the most recent emitted sync. A sync is emitted when a downstream reader
/// extrapolating linearly from the last sync would mistranslate by
/// `max_offset_lag` or more, or when extrapolation becomes invalid
/// (upstream gaps, downstream regressions).
#[derive(Debug)]
pub struct PartitionState {
    previous_upstream_offset: i64,
    previous_downstream_offset: i64,
    last_sync_upstream_offset: i64,
    last_sync_downstream_offset: i64,
    max_offset_lag: i64,
}

impl PartitionState {
    pub fn new(max_offset_lag: i64) -> Self {
        Self {
            previous_upstream_offset: -1,
            previous_downstream_offset: -1,
            last_sync_upstream_offset: -1,
            last_sync_downstream_offset: -1,
            max_offset_lag,
        }
    }

    /// Record an acknowledged `(upstream, downstream)` pair.
    ///
    /// Returns `true` if an offset sync should be emitted. Whether or not it
    /// fires, the previous-offset fields track the inputs; when it fires the
    /// last-sync fields do too.
    pub fn update(&mut self, upstream_offset: i64, downstream_offset: i64) -> bool {
        let mut should_sync_offsets = false;
        let upstream_step = upstream_offset - self.last_sync_upstream_offset;
        let downstream_target_offset = self.last_sync_downstream_offset + upstream_step;
        if self.last_sync_downstream_offset == -1
            || downstream_offset - downstream_target_offset >= self.max_offset_lag
            || upstream_offset - self.previous_upstream_offset != 1
            || downstream_offset < self.previous_downstream_offset
        {
            self.last_sync_upstream_offset = upstream_offset;
            self.last_sync_downstream_offset = downstream_offset;
            should_sync_offsets = true;
        }
        self.previous_upstream_offset = upstream_offset;
        self.previous_downstream_offset = downstream_offset;
        should_sync_offsets
    }

    /// Last observed upstream offset (-1 before the first update).
    pub fn previous_upstream_offset(&self) -> i64 {
        self.previous_upstream_offset
    }

    /// Last observed downstream offset (-1 before the first update).
    pub fn previous_downstream_offset(&self) -> i64 {
        self.previous_downstream_offset
    }

    /// Upstream offset of the most recent emitted sync (-1 before the first).
    pub fn last_sync_upstream_offset(&self) -> i64 {
        self.last_sync_upstream_offset
    }

    /// Downstream offset of the most recent emitted sync (-1 before the first).
    pub fn last_sync_downstream_offset(&self) -> i64 {
        self.last_sync_downstream_offset
    }
}

struct TaskInner<C, P> {
    consumer: C,
    producer: Arc<P>,
    partition_states: HashMap<TopicPartition, PartitionState>,
    metrics: TaskMetrics,
}

/// Replicates a set of source topic-partitions onto the target cluster.
pub struct ReplicationTask<C: LogConsumer, P: LogProducer> {
    assignment: TaskAssignment,
    /// The task lock: serializes poll, commit_record and stop.
    inner: Mutex<TaskInner<C, P>>,
    stopping: AtomicBool,
    /// Wakes the consumer out of an in-flight poll.
    wake: Notify,
    outstanding_offset_syncs: Arc<Semaphore>,
    state_tx: watch::Sender<TaskState>,
    state_rx: watch::Receiver<TaskState>,
}

impl<C: LogConsumer, P: LogProducer> ReplicationTask<C, P> {
    /// Start a task: seed the consumer from stored positions and assign its
    /// partitions.
    ///
    /// Stored offsets are the last *delivered* ones, so each is advanced by
    /// +1 before seeking; partitions with no stored position start from the
    /// earliest retained record. Failures propagate - the host aborts the
    /// task.
    pub async fn start<S>(
        assignment: TaskAssignment,
        consumer: C,
        producer: P,
        offset_storage: &S,
    ) -> Result<Self>
    where
        S: OffsetStorage + ?Sized,
    {
        let (state_tx, state_rx) = watch::channel(TaskState::Created);
        metrics::set_task_state("Created");

        let mut positions = Vec::with_capacity(assignment.assigned_partitions.len());
        let mut uncommitted = 0usize;
        for tp in &assignment.assigned_partitions {
            let wrapped = storage::wrap_partition(tp, &assignment.source_cluster_alias);
            let stored = offset_storage.load(&wrapped).await?;
            let stored_offset = storage::unwrap_offset(stored.as_ref());
            let position = if stored_offset < 0 {
                uncommitted += 1;
                EARLIEST_OFFSET
            } else {
                stored_offset + 1
            };
            positions.push((tp.clone(), position));
        }
        consumer.assign(&positions)?;
        trace!(?positions, "Seeked consumer positions");
        info!(
            partitions = assignment.assigned_partitions.len(),
            uncommitted,
            source = %assignment.source_cluster_alias,
            target = %assignment.target_cluster_alias,
            "Replicating topic-partitions"
        );

        let metrics_sink = TaskMetrics::new(
            assignment.source_cluster_alias.clone(),
            assignment.target_cluster_alias.clone(),
        );

        let task = Self {
            assignment,
            inner: Mutex::new(TaskInner {
                consumer,
                producer: Arc::new(producer),
                partition_states: HashMap::new(),
                metrics: metrics_sink,
            }),
            stopping: AtomicBool::new(false),
            wake: Notify::new(),
            outstanding_offset_syncs: Arc::new(Semaphore::new(MAX_OUTSTANDING_OFFSET_SYNCS)),
            state_tx,
            state_rx,
        };
        let _ = task.state_tx.send(TaskState::Running);
        metrics::set_task_state("Running");
        Ok(task)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn state_receiver(&self) -> watch::Receiver<TaskState> {
        self.state_rx.clone()
    }

    /// The assignment this task is running.
    pub fn assignment(&self) -> &TaskAssignment {
        &self.assignment
    }

    /// Fetch and convert the next batch for the host to publish.
    ///
    /// Returns `Ok(None)` (the "no work" sentinel) when stopping, when the
    /// poll was woken, when nothing arrived within the poll timeout, and on
    /// any caught transport fault (logged; the host just calls again).
    pub async fn poll(&self) -> Result<Option<Vec<ForwardedRecord>>> {
        let inner = self.inner.lock().await;
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let poll_start = Instant::now();
        let batch = tokio::select! {
            biased;

            _ = self.wake.notified() => {
                // Expected during shutdown; not an error.
                debug!("Poll interrupted by wake signal");
                return Ok(None);
            }

            result = inner.consumer.poll(self.assignment.poll_timeout) => match result {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, "Failure during poll");
                    return Ok(None);
                }
            },
        };
        metrics::record_poll(batch.len(), poll_start.elapsed());

        if batch.is_empty() {
            return Ok(None);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut forwarded = Vec::with_capacity(batch.len());
        for record in batch {
            match self.convert_record(record) {
                Ok(converted) => {
                    let target_tp = converted.topic_partition();
                    inner.metrics.record_age(&target_tp, now_ms - converted.timestamp_ms);
                    inner
                        .metrics
                        .record_bytes(&target_tp, converted.value.as_ref().map(Vec::len).unwrap_or(0));
                    forwarded.push(converted);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to convert record, skipping");
                }
            }
        }

        if forwarded.is_empty() {
            // Hosts expect a non-empty batch or the sentinel.
            return Ok(None);
        }
        trace!(count = forwarded.len(), "Polled records");
        Ok(Some(forwarded))
    }

    /// Record a target-side acknowledgement for a forwarded record.
    ///
    /// Updates the partition's decision state and emits an offset sync when
    /// the rule fires. An ack without a concrete offset is logged and
    /// skipped without touching partition state.
    pub async fn commit_record(&self, record: &ForwardedRecord, metadata: RecordMetadata) {
        let mut inner = self.inner.lock().await;
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let Some(downstream_offset) = metadata.offset else {
            error!(
                topic = %record.topic,
                "Record metadata has no offset, cannot sync offsets"
            );
            return;
        };

        let target_tp = record.topic_partition();
        let latency_ms = chrono::Utc::now().timestamp_millis() - record.timestamp_ms;
        let TaskInner {
            partition_states,
            producer,
            metrics: task_metrics,
            ..
        } = &mut *inner;
        task_metrics.count_record(&target_tp);
        task_metrics.replication_latency(&target_tp, latency_ms);

        let state = partition_states
            .entry(record.source_topic_partition.clone())
            .or_insert_with(|| PartitionState::new(self.assignment.max_offset_lag));
        if state.update(record.source_offset, downstream_offset) {
            self.send_offset_sync(
                producer,
                record.source_topic_partition.clone(),
                record.source_offset,
                downstream_offset,
            );
        }
    }

    /// Stop the task: wake any in-flight poll, then close the clients with
    /// bounded timeouts. Idempotent; after return no pump iteration or sync
    /// emission occurs.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Stop already requested");
            return;
        }
        let stop_start = Instant::now();
        self.wake.notify_one();
        let _ = self.state_tx.send(TaskState::Stopping);
        metrics::set_task_state("Stopping");

        let inner = self.inner.lock().await;
        if let Err(e) = inner.consumer.close(CLIENT_CLOSE_TIMEOUT).await {
            warn!(error = %e, "Failure closing consumer");
        }
        if let Err(e) = inner.producer.close(CLIENT_CLOSE_TIMEOUT).await {
            warn!(error = %e, "Failure closing offset producer");
        }
        inner.metrics.close();

        let _ = self.state_tx.send(TaskState::Stopped);
        metrics::set_task_state("Stopped");
        info!(
            elapsed_ms = stop_start.elapsed().as_millis() as u64,
            "Replication task stopped"
        );
    }

    /// Convert a fetched source record into its target-side shape.
    fn convert_record(&self, record: FetchedRecord) -> Result<ForwardedRecord> {
        if record.topic.is_empty() {
            return Err(MirrorError::Internal(
                "fetched record has no topic".to_string(),
            ));
        }
        let target_topic = self
            .assignment
            .replication_policy
            .format_remote_topic(&self.assignment.source_cluster_alias, &record.topic);
        Ok(ForwardedRecord {
            source_topic_partition: record.topic_partition(),
            source_offset: record.offset,
            topic: target_topic,
            partition: record.partition,
            key: record.key,
            value: record.value,
            timestamp_ms: record.timestamp_ms,
            headers: record.headers,
        })
    }

    /// Emit one offset sync onto `(offset_syncs_topic, partition 0)`.
    ///
    /// Acquiring a permit is non-blocking; with the bound exhausted the sync
    /// is dropped and the next qualifying update tries again. The permit is
    /// released on acknowledgement, success or error. Errors are logged, not
    /// retried.
    fn send_offset_sync(
        &self,
        producer: &Arc<P>,
        topic_partition: TopicPartition,
        upstream_offset: i64,
        downstream_offset: i64,
    ) {
        let permit = match Arc::clone(&self.outstanding_offset_syncs).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Too many outstanding offset syncs.
                trace!(tp = %topic_partition, "Dropping offset sync, too many in flight");
                metrics::record_offset_sync_dropped(&topic_partition);
                return;
            }
        };

        let offset_sync = OffsetSync::new(topic_partition.clone(), upstream_offset, downstream_offset);
        let send = producer.send(
            &self.assignment.offset_syncs_topic,
            0,
            offset_sync.encode_key(),
            offset_sync.encode_value(),
        );
        tokio::spawn(async move {
            match send.await {
                Ok(_) => {
                    trace!(
                        tp = %topic_partition,
                        upstream_offset,
                        downstream_offset,
                        "Sync'd offsets"
                    );
                    metrics::record_offset_sync_sent(&topic_partition);
                }
                Err(e) => {
                    error!(error = %e, tp = %topic_partition, "Failure sending offset sync");
                    metrics::record_offset_sync_failed(&topic_partition);
                }
            }
            drop(permit);
        });
    }
}
