// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote topic naming and internal-topic classification.
//!
//! A [`ReplicationPolicy`] decides what a source topic is called on the
//! target cluster, and recognizes the engine's internal topics so the
//! orchestrator never replicates them back to the source. The default policy
//! prefixes the source cluster alias: `primary.events`. Policies are
//! pluggable; the task assignment carries one as a trait object.

use std::fmt;

/// Name of the heartbeats topic on each source cluster.
pub const HEARTBEATS_TOPIC: &str = "heartbeats";

/// Suffix of per-flow checkpoint topics, e.g. `primary.checkpoints.internal`.
pub const CHECKPOINTS_TOPIC_SUFFIX: &str = ".checkpoints.internal";

/// Prefix of per-flow offset-syncs topics, e.g. `mm2-offset-syncs.backup.internal`.
pub const OFFSET_SYNCS_TOPIC_PREFIX: &str = "mm2-offset-syncs.";

/// Strategy for renaming topics on the target side and classifying
/// internal topics.
pub trait ReplicationPolicy: Send + Sync + fmt::Debug {
    /// Name of `topic` as replicated from `source_alias` onto the target.
    fn format_remote_topic(&self, source_alias: &str, topic: &str) -> String;

    /// The source cluster alias a remote topic came from, if `topic` is a
    /// remote topic under this policy.
    fn topic_source(&self, topic: &str) -> Option<String>;

    /// The name `topic` had on its source cluster, if `topic` is a remote
    /// topic under this policy.
    fn upstream_topic(&self, topic: &str) -> Option<String>;

    /// Whether `topic` carries heartbeats (locally emitted or replicated).
    fn is_heartbeats_topic(&self, topic: &str) -> bool;

    /// Whether `topic` carries checkpoints for some flow.
    fn is_checkpoints_topic(&self, topic: &str) -> bool;

    /// Whether `topic` is one of the engine's internal topics. Internal
    /// topics are never replicated back to the source.
    fn is_internal_topic(&self, topic: &str) -> bool;
}

/// Default naming strategy: `source_alias` + separator + `topic`.
#[derive(Debug, Clone)]
pub struct DefaultReplicationPolicy {
    separator: String,
}

impl DefaultReplicationPolicy {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }
}

impl Default for DefaultReplicationPolicy {
    fn default() -> Self {
        Self::new(".")
    }
}

impl ReplicationPolicy for DefaultReplicationPolicy {
    fn format_remote_topic(&self, source_alias: &str, topic: &str) -> String {
        format!("{}{}{}", source_alias, self.separator, topic)
    }

    fn topic_source(&self, topic: &str) -> Option<String> {
        topic
            .split_once(&self.separator)
            .map(|(source, _)| source.to_string())
    }

    fn upstream_topic(&self, topic: &str) -> Option<String> {
        topic
            .split_once(&self.separator)
            .map(|(_, upstream)| upstream.to_string())
    }

    fn is_heartbeats_topic(&self, topic: &str) -> bool {
        // Matches "heartbeats" and any replication depth of it,
        // e.g. "primary.heartbeats", "eu.primary.heartbeats".
        topic == HEARTBEATS_TOPIC
            || topic.ends_with(&format!("{}{}", self.separator, HEARTBEATS_TOPIC))
    }

    fn is_checkpoints_topic(&self, topic: &str) -> bool {
        topic.ends_with(CHECKPOINTS_TOPIC_SUFFIX)
    }

    fn is_internal_topic(&self, topic: &str) -> bool {
        self.is_checkpoints_topic(topic)
            || (topic.starts_with(OFFSET_SYNCS_TOPIC_PREFIX) && topic.ends_with(".internal"))
    }
}
