//! Configuration for a replication flow.
//!
//! This module defines the options one source→target flow consumes and the
//! immutable [`TaskAssignment`] an orchestrator hands to each task.
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mirror_engine::config::{ClusterConfig, MirrorConfig};
//!
//! let config = MirrorConfig {
//!     source_cluster_alias: "primary".into(),
//!     target_cluster_alias: "backup".into(),
//!     source: ClusterConfig::for_testing("localhost:9092"),
//!     target: ClusterConfig::for_testing("localhost:9192"),
//!     ..MirrorConfig::for_testing("primary")
//! };
//!
//! assert_eq!(config.offset_syncs_topic(), "mm2-offset-syncs.backup.internal");
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source_cluster_alias: "primary"
//! target_cluster_alias: "backup"
//!
//! source:
//!   bootstrap_servers: "kafka-primary-1:9092,kafka-primary-2:9092"
//! target:
//!   bootstrap_servers: "kafka-backup-1:9092"
//!
//! offset_lag_max: 100
//! consumer_poll_timeout: "1s"
//! replication_policy_separator: "."
//! ```

use crate::policy::{DefaultReplicationPolicy, ReplicationPolicy, CHECKPOINTS_TOPIC_SUFFIX, HEARTBEATS_TOPIC};
use crate::sync::TopicPartition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// MirrorConfig: one source→target flow
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for one source→target flow.
///
/// # Fields
///
/// - `source_cluster_alias`: required; used in remote topic naming and
///   offset-storage keys.
/// - `target_cluster_alias`: used in internal topic naming and metrics tags.
/// - `offset_lag_max`: how out-of-sync a remote partition can be before a
///   new offset sync is emitted.
/// - `consumer_poll_timeout`: poll deadline against the source cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Alias of the source cluster.
    pub source_cluster_alias: String,

    /// Alias of the target cluster.
    #[serde(default = "default_target_alias")]
    pub target_cluster_alias: String,

    /// Source cluster connection settings.
    #[serde(default)]
    pub source: ClusterConfig,

    /// Target cluster connection settings.
    #[serde(default)]
    pub target: ClusterConfig,

    /// Largest tolerated translation error, in records, before a new offset
    /// sync is emitted.
    #[serde(default = "default_offset_lag_max")]
    pub offset_lag_max: i64,

    /// Poll deadline against the source cluster, as a duration string
    /// (e.g. "1s"). Parsed to Duration internally.
    #[serde(default = "default_consumer_poll_timeout")]
    pub consumer_poll_timeout: String,

    /// Separator used in the remote topic naming convention.
    #[serde(default = "default_policy_separator")]
    pub replication_policy_separator: String,
}

fn default_target_alias() -> String {
    "target".to_string()
}

fn default_offset_lag_max() -> i64 {
    100
}

fn default_consumer_poll_timeout() -> String {
    "1s".to_string()
}

fn default_policy_separator() -> String {
    ".".to_string()
}

impl MirrorConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(source_cluster_alias: &str) -> Self {
        Self {
            source_cluster_alias: source_cluster_alias.to_string(),
            target_cluster_alias: default_target_alias(),
            source: ClusterConfig::default(),
            target: ClusterConfig::default(),
            offset_lag_max: default_offset_lag_max(),
            consumer_poll_timeout: default_consumer_poll_timeout(),
            replication_policy_separator: default_policy_separator(),
        }
    }

    /// Validate the required fields.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.source_cluster_alias.is_empty() {
            return Err(crate::error::MirrorError::Config(
                "source_cluster_alias is required".to_string(),
            ));
        }
        if self.target_cluster_alias.is_empty() {
            return Err(crate::error::MirrorError::Config(
                "target_cluster_alias is required".to_string(),
            ));
        }
        if self.offset_lag_max < 0 {
            return Err(crate::error::MirrorError::Config(format!(
                "offset_lag_max must be non-negative, got {}",
                self.offset_lag_max
            )));
        }
        Ok(())
    }

    /// Parse the consumer poll timeout to a Duration.
    pub fn consumer_poll_timeout(&self) -> Duration {
        humantime::parse_duration(&self.consumer_poll_timeout).unwrap_or(Duration::from_secs(1))
    }

    /// Name of the compacted offset-syncs topic for this flow.
    pub fn offset_syncs_topic(&self) -> String {
        // ".internal" suffix keeps this from being replicated back
        format!("mm2-offset-syncs.{}.internal", self.target_cluster_alias)
    }

    /// Name of the heartbeats topic on the source cluster.
    pub fn heartbeats_topic(&self) -> String {
        HEARTBEATS_TOPIC.to_string()
    }

    /// Name of the replicated heartbeats topic on the target, e.g.
    /// `primary.heartbeats`.
    pub fn target_heartbeats_topic(&self) -> String {
        self.replication_policy()
            .format_remote_topic(&self.source_cluster_alias, HEARTBEATS_TOPIC)
    }

    /// Name of the checkpoints topic for this flow. Checkpoint topics are
    /// not remote topics (they are never replicated), so the policy is not
    /// involved.
    pub fn checkpoints_topic(&self) -> String {
        format!("{}{}", self.source_cluster_alias, CHECKPOINTS_TOPIC_SUFFIX)
    }

    /// Consumer group id used by this flow's source consumers.
    pub fn consumer_group_id(&self) -> String {
        format!(
            "mirror-{}-{}",
            self.source_cluster_alias, self.target_cluster_alias
        )
    }

    /// The naming policy configured for this flow.
    pub fn replication_policy(&self) -> Arc<dyn ReplicationPolicy> {
        Arc::new(DefaultReplicationPolicy::new(
            self.replication_policy_separator.clone(),
        ))
    }

    /// Build the immutable assignment for one task activation.
    pub fn task_assignment(&self, assigned_partitions: Vec<TopicPartition>) -> TaskAssignment {
        TaskAssignment {
            source_cluster_alias: self.source_cluster_alias.clone(),
            target_cluster_alias: self.target_cluster_alias.clone(),
            assigned_partitions,
            max_offset_lag: self.offset_lag_max,
            poll_timeout: self.consumer_poll_timeout(),
            offset_syncs_topic: self.offset_syncs_topic(),
            replication_policy: self.replication_policy(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: connection settings for one cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection settings for a single cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bootstrap broker list, comma separated.
    pub bootstrap_servers: String,

    /// Raw client options passed through to the underlying client
    /// (security settings, timeouts, etc.).
    #[serde(default)]
    pub client_overrides: HashMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_overrides: HashMap::new(),
        }
    }
}

impl ClusterConfig {
    /// Create a cluster config for testing.
    pub fn for_testing(bootstrap_servers: &str) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.to_string(),
            client_overrides: HashMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TaskAssignment: immutable input to one task activation
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable assignment handed to a [`crate::ReplicationTask`] by the
/// orchestrator. Lifetime = one task activation.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub source_cluster_alias: String,
    pub target_cluster_alias: String,
    /// Source topic-partitions this task replicates.
    pub assigned_partitions: Vec<TopicPartition>,
    /// Drift tolerance for offset-sync emission.
    pub max_offset_lag: i64,
    /// Poll deadline against the source cluster.
    pub poll_timeout: Duration,
    /// Name of the compacted offset-syncs topic.
    pub offset_syncs_topic: String,
    /// Remote topic naming strategy.
    pub replication_policy: Arc<dyn ReplicationPolicy>,
}

impl TaskAssignment {
    /// Create an assignment with defaults for testing.
    pub fn for_testing(assigned_partitions: Vec<TopicPartition>) -> Self {
        Self {
            source_cluster_alias: "primary".to_string(),
            target_cluster_alias: "backup".to_string(),
            assigned_partitions,
            max_offset_lag: 100,
            poll_timeout: Duration::from_millis(100),
            offset_syncs_topic: "mm2-offset-syncs.backup.internal".to_string(),
            replication_policy: Arc::new(DefaultReplicationPolicy::default()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
