// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! rdkafka-backed implementations of the transport seams.
//!
//! [`KafkaLogConsumer`] wraps a manually-assigned `StreamConsumer`: no
//! consumer-group rebalancing, positions are seeded explicitly by the task.
//! [`KafkaLogProducer`] wraps an idempotent `FutureProducer` whose delivery
//! report carries the acknowledged offset.

use crate::client::{BoxFuture, FetchedRecord, LogConsumer, LogProducer, EARLIEST_OFFSET};
use crate::config::ClusterConfig;
use crate::error::{MirrorError, Result};
use crate::sync::TopicPartition;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Largest batch one poll returns.
const MAX_POLL_RECORDS: usize = 500;

/// How long to wait for further buffered messages once the first arrived.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Queue deadline for offset-sync produces.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

fn base_client_config(cluster: &ClusterConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", &cluster.bootstrap_servers);
    for (key, value) in &cluster.client_overrides {
        config.set(key, value);
    }
    config
}

/// Manually-assigned consumer over one cluster.
pub struct KafkaLogConsumer {
    // Shared so close() can hand the client to a blocking task.
    inner: Arc<StreamConsumer>,
}

impl KafkaLogConsumer {
    /// Build a consumer for `cluster`.
    ///
    /// The group id is required by the client but only used for broker-side
    /// bookkeeping: partitions are always assigned manually and offsets are
    /// never committed to the group.
    pub fn from_config(cluster: &ClusterConfig, group_id: &str) -> Result<Self> {
        let mut config = base_client_config(cluster);
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");
        let inner: StreamConsumer = config
            .create()
            .map_err(|e| MirrorError::kafka("create consumer", e))?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn convert(message: &BorrowedMessage<'_>) -> FetchedRecord {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| (header.key.to_string(), header.value.map(<[u8]>::to_vec)))
                    .collect()
            })
            .unwrap_or_default();
        FetchedRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis().unwrap_or(-1),
            headers,
        }
    }
}

impl LogConsumer for KafkaLogConsumer {
    fn assign(&self, positions: &[(TopicPartition, i64)]) -> Result<()> {
        let mut list = TopicPartitionList::new();
        for (tp, position) in positions {
            let offset = if *position <= EARLIEST_OFFSET {
                Offset::Beginning
            } else {
                Offset::Offset(*position)
            };
            list.add_partition_offset(&tp.topic, tp.partition, offset)
                .map_err(|e| MirrorError::kafka("assign", e))?;
        }
        self.inner
            .assign(&list)
            .map_err(|e| MirrorError::kafka("assign", e))
    }

    fn poll(&self, timeout: Duration) -> BoxFuture<'_, Vec<FetchedRecord>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut stream = self.inner.stream();

            // The first message may wait up to the poll timeout; the rest of
            // the batch drains whatever the client already buffered.
            match tokio::time::timeout(timeout, stream.next()).await {
                Err(_) | Ok(None) => return Ok(records),
                Ok(Some(Ok(message))) => records.push(Self::convert(&message)),
                Ok(Some(Err(e))) => return Err(MirrorError::kafka("poll", e)),
            }
            while records.len() < MAX_POLL_RECORDS {
                match tokio::time::timeout(DRAIN_TIMEOUT, stream.next()).await {
                    Ok(Some(Ok(message))) => records.push(Self::convert(&message)),
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "Fetch error while draining batch");
                        break;
                    }
                    Err(_) | Ok(None) => break,
                }
            }
            Ok(records)
        })
    }

    fn close(&self, timeout: Duration) -> BoxFuture<'_, ()> {
        // Unassigning stops all fetching; librdkafka tears the client down
        // fully when the consumer is dropped. unassign() can block on the
        // broker, so keep it off the runtime and inside the promised bound.
        let consumer = Arc::clone(&self.inner);
        Box::pin(async move {
            let unassign = tokio::task::spawn_blocking(move || consumer.unassign());
            match tokio::time::timeout(timeout, unassign).await {
                Ok(Ok(result)) => result.map_err(|e| MirrorError::kafka("close", e)),
                Ok(Err(e)) => Err(MirrorError::Internal(format!("close task panicked: {}", e))),
                Err(_) => Err(MirrorError::kafka_msg(
                    "close",
                    format!("unassign did not finish within {} ms", timeout.as_millis()),
                )),
            }
        })
    }
}

/// Idempotent producer onto one cluster.
pub struct KafkaLogProducer {
    inner: FutureProducer,
}

impl KafkaLogProducer {
    pub fn from_config(cluster: &ClusterConfig) -> Result<Self> {
        let mut config = base_client_config(cluster);
        config
            .set("enable.idempotence", "true")
            .set("acks", "all");
        let inner: FutureProducer = config
            .create()
            .map_err(|e| MirrorError::kafka("create producer", e))?;
        Ok(Self { inner })
    }
}

impl LogProducer for KafkaLogProducer {
    fn send(
        &self,
        topic: &str,
        partition: i32,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> BoxFuture<'static, i64> {
        let producer = self.inner.clone();
        let topic = topic.to_string();
        Box::pin(async move {
            let record = FutureRecord::to(&topic)
                .partition(partition)
                .key(&key)
                .payload(&value);
            match producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
                Ok((_partition, offset)) => Ok(offset),
                Err((e, _message)) => Err(MirrorError::kafka("send", e)),
            }
        })
    }

    fn close(&self, timeout: Duration) -> BoxFuture<'_, ()> {
        let producer = self.inner.clone();
        Box::pin(async move {
            // flush() blocks the calling thread; keep it off the runtime.
            let result =
                tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MirrorError::kafka("flush", e)),
                Err(e) => Err(MirrorError::Internal(format!("flush task panicked: {}", e))),
            }
        })
    }
}
