//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replicated record volume, age and latency
//! - Poll loop behavior
//! - Offset-sync emission (sent / dropped / failed)
//! - Offset translation hits and misses
//! - Offset storage flushes and retries
//! - Task lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Reporters (metric recorders) are registered by the host process, never
//! here; without a recorder every call below is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mirror_engine::metrics::TaskMetrics;
//! use mirror_engine::sync::TopicPartition;
//!
//! let sink = TaskMetrics::new("primary", "backup");
//! sink.record_age(&TopicPartition::new("primary.events", 0), 125);
//! sink.close();
//! ```

use crate::sync::TopicPartition;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Per-task metrics sink, tagged with the flow's cluster aliases.
///
/// Owned by the task and closed with it.
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    source: String,
    target: String,
}

impl TaskMetrics {
    pub fn new(source_alias: impl Into<String>, target_alias: impl Into<String>) -> Self {
        Self {
            source: source_alias.into(),
            target: target_alias.into(),
        }
    }

    /// Record the age of a fetched record (now - record timestamp) for a
    /// target topic-partition.
    pub fn record_age(&self, tp: &TopicPartition, age_ms: i64) {
        histogram!(
            "mirror_record_age_ms",
            "source" => self.source.clone(),
            "target" => self.target.clone(),
            "topic" => tp.topic.clone(),
            "partition" => tp.partition.to_string()
        )
        .record(age_ms.max(0) as f64);
    }

    /// Record the byte volume replicated to a target topic-partition.
    pub fn record_bytes(&self, tp: &TopicPartition, n: usize) {
        counter!(
            "mirror_record_bytes_total",
            "source" => self.source.clone(),
            "target" => self.target.clone(),
            "topic" => tp.topic.clone(),
            "partition" => tp.partition.to_string()
        )
        .increment(n as u64);
    }

    /// Count one record acknowledged by the target.
    pub fn count_record(&self, tp: &TopicPartition) {
        counter!(
            "mirror_records_total",
            "source" => self.source.clone(),
            "target" => self.target.clone(),
            "topic" => tp.topic.clone(),
            "partition" => tp.partition.to_string()
        )
        .increment(1);
    }

    /// Record end-to-end replication latency (now - record timestamp at ack).
    pub fn replication_latency(&self, tp: &TopicPartition, latency_ms: i64) {
        histogram!(
            "mirror_replication_latency_ms",
            "source" => self.source.clone(),
            "target" => self.target.clone(),
            "topic" => tp.topic.clone(),
            "partition" => tp.partition.to_string()
        )
        .record(latency_ms.max(0) as f64);
    }

    /// Tear down the sink.
    pub fn close(&self) {
        tracing::debug!(source = %self.source, target = %self.target, "Task metrics closed");
    }
}

/// Record one pump poll iteration.
pub fn record_poll(record_count: usize, duration: Duration) {
    counter!("mirror_polls_total").increment(1);
    if record_count > 0 {
        counter!("mirror_poll_records_total").increment(record_count as u64);
    }
    histogram!("mirror_poll_duration_seconds").record(duration.as_secs_f64());
}

/// Record an offset sync acknowledged by the syncs topic.
pub fn record_offset_sync_sent(tp: &TopicPartition) {
    counter!("mirror_offset_syncs_total", "topic" => tp.topic.clone(), "partition" => tp.partition.to_string(), "outcome" => "sent")
        .increment(1);
}

/// Record an offset sync dropped because too many were in flight.
pub fn record_offset_sync_dropped(tp: &TopicPartition) {
    counter!("mirror_offset_syncs_total", "topic" => tp.topic.clone(), "partition" => tp.partition.to_string(), "outcome" => "dropped")
        .increment(1);
}

/// Record an offset sync whose produce failed.
pub fn record_offset_sync_failed(tp: &TopicPartition) {
    counter!("mirror_offset_syncs_total", "topic" => tp.topic.clone(), "partition" => tp.partition.to_string(), "outcome" => "failed")
        .increment(1);
}

/// Record an offset sync applied by the store.
pub fn record_sync_applied(tp: &TopicPartition) {
    counter!("mirror_syncs_applied_total", "topic" => tp.topic.clone(), "partition" => tp.partition.to_string())
        .increment(1);
}

/// Record a translation query outcome.
pub fn record_translation(translatable: bool) {
    let outcome = if translatable { "translated" } else { "not_translatable" };
    counter!("mirror_translations_total", "outcome" => outcome).increment(1);
}

/// Gauge for task lifecycle state.
pub fn set_task_state(state: &str) {
    // Encode state as numeric for alerting (0=created, 1=running, ...)
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Stopping" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("mirror_task_state").set(value);
}

/// Record an offset-storage flush batch (debounced writes).
pub fn record_offset_flush(flushed: usize, errors: usize) {
    counter!("mirror_offset_flushes_total").increment(1);
    counter!("mirror_offsets_flushed_total").increment(flushed as u64);
    if errors > 0 {
        counter!("mirror_offset_flush_errors_total").increment(errors as u64);
    }
}

/// Record an offset-storage SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn offset_storage_retries_total(operation: &str) {
    counter!("mirror_offset_storage_retries_total", "operation" => operation.to_string()).increment(1);
}
