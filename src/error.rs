// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! This module defines the error types used throughout the engine. Errors
//! are categorized by their source (cluster transport, offset storage, etc.)
//! and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Kafka` | Yes | Broker errors, timeouts, connection failures |
//! | `OffsetStorage` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `Codec` | No | Malformed offset-sync record |
//! | `InvalidState` | No | Task state machine violation |
//! | `Shutdown` | No | Task or store is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Nothing inside the replication pump retries: the orchestrator's restart
//! policy is the only retry layer. [`MirrorError::is_retryable()`] tells the
//! orchestrator whether restarting the task can help. Retryable errors
//! indicate transient broker or network issues; non-retryable errors indicate
//! bugs, configuration problems, or data corruption.

use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while replicating.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check whether restarting
/// the operation can help.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Cluster transport error.
    ///
    /// Occurs when communicating with the source or target cluster.
    /// These are typically retryable (broker timeouts, connection drops).
    #[error("Kafka error ({operation}): {message}")]
    Kafka {
        operation: String,
        message: String,
        #[source]
        source: Option<rdkafka::error::KafkaError>,
    },

    /// SQLite error during offset persistence.
    ///
    /// Occurs when reading/writing source positions to SQLite.
    /// Not retryable - indicates local database issues that need attention.
    #[error("Offset storage error: {0}")]
    OffsetStorage(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Occurs during task initialization if config is malformed.
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Offset-sync record decoding failure.
    ///
    /// Occurs when a record on the offset-syncs topic has unexpected format.
    /// Not retryable - the record is malformed at the source.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Task state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state.
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted after close.
    /// Not retryable - the task or store is terminating.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    /// Not retryable - indicates a bug that needs investigation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Create a Kafka error from an rdkafka error
    pub fn kafka(operation: impl Into<String>, source: rdkafka::error::KafkaError) -> Self {
        Self::Kafka {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Kafka error without source
    pub fn kafka_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kafka {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if restarting the failed operation can help
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kafka { .. } => true, // Broker/network errors are retryable
            Self::OffsetStorage(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::Codec(_) => false, // Malformed data
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<rdkafka::error::KafkaError> for MirrorError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        Self::kafka("unknown", e)
    }
}
