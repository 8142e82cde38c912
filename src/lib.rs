// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Mirror Engine
//!
//! A replication data-plane for mirroring records between two independent
//! log clusters (a "source" and a "target"), preserving per-partition order
//! and letting downstream consumers resume on the target using offsets
//! translated from the source.
//!
//! ## Architecture
//!
//! Each flow runs one or more [`ReplicationTask`]s, each owning a source
//! consumer and an offset-sync producer. The host publishes forwarded batches
//! to the target cluster and calls back with per-record acknowledgements:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             mirror-engine                                │
//! │                                                                          │
//! │  source cluster ──► ReplicationTask ──► ForwardedRecord batch ──► host   │
//! │                        │         ▲                                 │     │
//! │                        │         └──── commit_record(ack) ◄────────┘     │
//! │                        ▼                                                 │
//! │                  PartitionState ──emit──► offset-syncs topic (compacted) │
//! │                                                  │                       │
//! │                                                  ▼                       │
//! │                                          OffsetSyncStore                 │
//! │                                  (offset translation for checkpoints)    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Offset translation
//!
//! Source and target partitions have independent histories, so a source
//! offset cannot be used on the target directly. The task emits a compact
//! [`OffsetSync`] record whenever linear extrapolation from the last sync
//! would mistranslate by `offset_lag_max` or more, or becomes invalid
//! (offset gaps, downstream regressions). [`OffsetSyncStore`] tails the
//! compacted sync log and answers `translate_downstream` queries for a
//! sibling checkpoint task.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_engine::{MemoryOffsetStorage, ReplicationTask, TopicPartition};
//! use mirror_engine::kafka::{KafkaLogConsumer, KafkaLogProducer};
//! use mirror_engine::config::MirrorConfig;
//!
//! # async fn run() -> mirror_engine::Result<()> {
//! let config = MirrorConfig::for_testing("primary");
//! let assignment = config.task_assignment(vec![TopicPartition::new("events", 0)]);
//!
//! let consumer = KafkaLogConsumer::from_config(&config.source, &config.consumer_group_id())?;
//! let producer = KafkaLogProducer::from_config(&config.source)?;
//! let storage = MemoryOffsetStorage::new();
//!
//! let task = ReplicationTask::start(assignment, consumer, producer, &storage).await?;
//! while let Some(_batch) = task.poll().await? {
//!     // publish the batch to the target cluster, then ack each record:
//!     // task.commit_record(&record, metadata).await;
//! }
//! task.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod policy;
pub mod storage;
pub mod store;
pub mod sync;
pub mod task;

// Re-exports for convenience
pub use client::{FetchedRecord, ForwardedRecord, LogConsumer, LogProducer, RecordMetadata};
pub use config::{ClusterConfig, MirrorConfig, TaskAssignment};
pub use error::{MirrorError, Result};
pub use policy::{DefaultReplicationPolicy, ReplicationPolicy};
pub use storage::{MemoryOffsetStorage, OffsetStorage, SqliteOffsetStorage};
pub use store::OffsetSyncStore;
pub use sync::{OffsetSync, TopicPartition};
pub use task::{ReplicationTask, TaskState};
