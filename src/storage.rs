// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offset storage for source positions.
//!
//! The pump persists how far it has read each source partition so a
//! restarted task resumes where the previous activation stopped. The host
//! owns the storage mechanism; the core only sees opaque key/value map
//! shapes built by [`wrap_partition`] and [`wrap_offset`] and read back by
//! [`unwrap_offset`]. The stored offset is the last *delivered* one: on
//! start the task seeks to `stored + 1`.
//!
//! # Debounced Writes
//!
//! [`SqliteOffsetStorage`] debounces to reduce SQLite write pressure:
//! - `save()` updates the in-memory cache immediately and marks the key dirty
//! - `flush_dirty()` persists all dirty offsets to disk in a batch
//! - The host calls `flush_dirty()` periodically (every few seconds)
//! - On shutdown, `close()` flushes before closing the pool
//!
//! A crash between `save()` and `flush_dirty()` loses up to one flush
//! interval of progress. On restart the task re-reads those records -
//! delivery is at-least-once and the offset-sync decision rule is
//! insensitive to replays.
//!
//! # SQLite Busy Handling
//!
//! Concurrent connections can surface SQLITE_BUSY/SQLITE_LOCKED. Every
//! write goes through `with_busy_retry`, which re-runs the statement with
//! doubling backoff for a handful of attempts. The cache is updated before
//! the disk write, so a statement that keeps losing the lock only delays
//! persistence; it never changes what readers see.

use crate::client::BoxFuture;
use crate::error::{MirrorError, Result};
use crate::sync::TopicPartition;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Build the host's opaque storage key for one source partition.
pub fn wrap_partition(tp: &TopicPartition, source_cluster_alias: &str) -> Value {
    json!({
        "cluster": source_cluster_alias,
        "topic": tp.topic,
        "partition": tp.partition,
    })
}

/// Build the host's opaque storage value for one offset.
pub fn wrap_offset(offset: i64) -> Value {
    json!({ "offset": offset })
}

/// Read an offset back out of the host's opaque value shape.
///
/// Tolerates a missing map and malformed values: both yield -1, the
/// "nothing stored" sentinel.
pub fn unwrap_offset(wrapped: Option<&Value>) -> i64 {
    wrapped
        .and_then(|v| v.get("offset"))
        .and_then(Value::as_i64)
        .unwrap_or(-1)
}

/// Read a storage key back into its parts. Used by storage implementations;
/// the core never calls this.
pub fn unwrap_partition(wrapped: &Value) -> Option<(String, TopicPartition)> {
    let cluster = wrapped.get("cluster")?.as_str()?.to_string();
    let topic = wrapped.get("topic")?.as_str()?.to_string();
    let partition = wrapped.get("partition")?.as_i64()?;
    Some((cluster, TopicPartition::new(topic, partition as i32)))
}

/// Host-side persistence of source positions.
///
/// Keys and values are the opaque map shapes from [`wrap_partition`] and
/// [`wrap_offset`]; implementations may interpret them, the core does not.
pub trait OffsetStorage: Send + Sync {
    /// Load the stored value for a wrapped partition key, if any.
    fn load(&self, wrapped_partition: &Value) -> BoxFuture<'_, Option<Value>>;

    /// Persist a wrapped offset under a wrapped partition key.
    fn save(&self, wrapped_partition: Value, wrapped_offset: Value) -> BoxFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory storage (tests, embedded hosts)
// ═══════════════════════════════════════════════════════════════════════════════

/// Volatile offset storage. Positions are lost on drop; a task started
/// against a fresh instance replicates every partition from the earliest
/// retained record.
#[derive(Default)]
pub struct MemoryOffsetStorage {
    // serde_json maps order their keys, so `to_string()` is canonical.
    offsets: RwLock<HashMap<String, Value>>,
}

impl MemoryOffsetStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored positions.
    pub async fn len(&self) -> usize {
        self.offsets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.offsets.read().await.is_empty()
    }
}

impl OffsetStorage for MemoryOffsetStorage {
    fn load(&self, wrapped_partition: &Value) -> BoxFuture<'_, Option<Value>> {
        let key = wrapped_partition.to_string();
        Box::pin(async move { Ok(self.offsets.read().await.get(&key).cloned()) })
    }

    fn save(&self, wrapped_partition: Value, wrapped_offset: Value) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.offsets
                .write()
                .await
                .insert(wrapped_partition.to_string(), wrapped_offset);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite-backed storage
// ═══════════════════════════════════════════════════════════════════════════════

const BUSY_MAX_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF_START: Duration = Duration::from_millis(10);
const BUSY_BACKOFF_CEILING: Duration = Duration::from_millis(500);

/// SQLITE_BUSY (code 5) and SQLITE_LOCKED (code 6) mean another connection
/// holds a lock; the statement is worth re-running, nothing is corrupt.
fn is_contention(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = error else {
        return false;
    };
    match db.code().as_deref() {
        Some("5") | Some("6") => true,
        Some(_) => false,
        // Some driver paths lose the code; fall back on the message.
        None => {
            let text = db.message().to_ascii_lowercase();
            text.contains("database is locked") || text.contains("database is busy")
        }
    }
}

/// Run a statement, re-running it with doubling backoff while SQLite
/// reports lock contention. Any other error aborts on the spot.
async fn with_busy_retry<T, F, Fut>(name: &str, mut statement: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut backoff = BUSY_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match statement().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(statement = name, attempt, "SQLite write went through after contention");
                }
                return Ok(value);
            }
            Err(error) if attempt < BUSY_MAX_ATTEMPTS && is_contention(&error) => {
                warn!(
                    statement = name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "SQLite contended, backing off"
                );
                crate::metrics::offset_storage_retries_total(name);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BUSY_BACKOFF_CEILING);
                attempt += 1;
            }
            Err(error) => {
                if is_contention(&error) {
                    warn!(statement = name, attempt, "SQLite contended, out of retries");
                }
                return Err(error);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OffsetKey {
    cluster: String,
    topic: String,
    partition: i32,
}

/// Persistent offset storage backed by SQLite.
///
/// Supports debounced writes: updates go to cache immediately, and are
/// flushed to disk periodically via [`flush_dirty()`](Self::flush_dirty).
pub struct SqliteOffsetStorage {
    /// SQLite connection pool
    pool: SqlitePool,
    /// In-memory cache for fast reads
    cache: Arc<RwLock<HashMap<OffsetKey, i64>>>,
    /// Keys with dirty (not yet persisted) offsets
    dirty: Arc<RwLock<HashSet<OffsetKey>>>,
    /// Path to database file
    path: String,
}

impl SqliteOffsetStorage {
    /// Open (or create) an offset database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing offset storage");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_offsets (
                cluster TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                record_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (cluster, topic, partition_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Load existing offsets into cache
        let rows: Vec<(String, String, i64, i64)> =
            sqlx::query_as("SELECT cluster, topic, partition_id, record_offset FROM source_offsets")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (cluster, topic, partition, offset) in rows {
            debug!(cluster = %cluster, topic = %topic, partition, offset, "Loaded offset from disk");
            cache.insert(
                OffsetKey {
                    cluster,
                    topic,
                    partition: partition as i32,
                },
                offset,
            );
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored source offsets from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Get the stored offset for a partition (from cache).
    ///
    /// Returns `None` if nothing was stored (first activation).
    pub async fn get(&self, cluster: &str, tp: &TopicPartition) -> Option<i64> {
        let key = OffsetKey {
            cluster: cluster.to_string(),
            topic: tp.topic.clone(),
            partition: tp.partition,
        };
        self.cache.read().await.get(&key).copied()
    }

    /// Update the stored offset for a partition (debounced).
    ///
    /// Updates cache immediately, marks the key dirty. Call
    /// [`flush_dirty()`](Self::flush_dirty) periodically to persist.
    pub async fn set(&self, cluster: &str, tp: &TopicPartition, offset: i64) {
        let key = OffsetKey {
            cluster: cluster.to_string(),
            topic: tp.topic.clone(),
            partition: tp.partition,
        };

        {
            let mut cache = self.cache.write().await;
            cache.insert(key.clone(), offset);
        }
        {
            let mut dirty = self.dirty.write().await;
            dirty.insert(key);
        }

        debug!(cluster = %cluster, tp = %tp, offset, "Offset updated (pending flush)");
    }

    /// Flush all dirty offsets to disk.
    ///
    /// Call this periodically (e.g., every 5 seconds) and on shutdown.
    /// Returns the number of offsets flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        // Swap out dirty set atomically
        let dirty_keys: Vec<OffsetKey> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for key in &dirty_keys {
            if let Some(offset) = cache.get(key).copied() {
                let result = with_busy_retry("offset_flush", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO source_offsets (cluster, topic, partition_id, record_offset, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(cluster, topic, partition_id) DO UPDATE SET
                            record_offset = excluded.record_offset,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&key.cluster)
                    .bind(&key.topic)
                    .bind(key.partition as i64)
                    .bind(offset)
                    .bind(now)
                    .execute(pool)
                    .await
                })
                .await;

                match result {
                    Ok(_) => {
                        flushed += 1;
                    }
                    Err(e) => {
                        errors += 1;
                        warn!(cluster = %key.cluster, topic = %key.topic, partition = key.partition,
                            error = %e, "Failed to flush offset");
                        // Re-mark as dirty so we retry next flush
                        self.dirty.write().await.insert(key.clone());
                    }
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty offsets");
            crate::metrics::record_offset_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(MirrorError::Internal(format!(
                "Failed to flush {} offsets",
                errors
            )));
        }

        Ok(flushed)
    }

    /// Check if there are any dirty (unflushed) offsets.
    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    /// Get count of dirty offsets pending flush.
    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Delete the stored offset for a partition (e.g., when it leaves the
    /// assignment). Retries on SQLITE_BUSY/SQLITE_LOCKED.
    pub async fn delete(&self, cluster: &str, tp: &TopicPartition) -> Result<()> {
        let key = OffsetKey {
            cluster: cluster.to_string(),
            topic: tp.topic.clone(),
            partition: tp.partition,
        };
        {
            let mut cache = self.cache.write().await;
            cache.remove(&key);
        }

        let pool = &self.pool;
        with_busy_retry("offset_delete", || async {
            sqlx::query(
                "DELETE FROM source_offsets WHERE cluster = ? AND topic = ? AND partition_id = ?",
            )
            .bind(&key.cluster)
            .bind(&key.topic)
            .bind(key.partition as i64)
            .execute(pool)
            .await
        })
        .await?;

        info!(cluster = %cluster, tp = %tp, "Deleted stored offset");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("offset_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    ///
    /// Flushes any dirty offsets and checkpoints WAL before closing.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "Flushed dirty offsets on close");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to flush dirty offsets on close");
                }
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Offset storage closed");
    }
}

impl OffsetStorage for SqliteOffsetStorage {
    fn load(&self, wrapped_partition: &Value) -> BoxFuture<'_, Option<Value>> {
        let parsed = unwrap_partition(wrapped_partition);
        Box::pin(async move {
            let Some((cluster, tp)) = parsed else {
                warn!("Unrecognized offset storage key shape");
                return Ok(None);
            };
            Ok(self.get(&cluster, &tp).await.map(wrap_offset))
        })
    }

    fn save(&self, wrapped_partition: Value, wrapped_offset: Value) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some((cluster, tp)) = unwrap_partition(&wrapped_partition) else {
                warn!("Unrecognized offset storage key shape, not persisting");
                return Ok(());
            };
            let offset = unwrap_offset(Some(&wrapped_offset));
            self.set(&cluster, &tp, offset).await;
            Ok(())
        })
    }
}
