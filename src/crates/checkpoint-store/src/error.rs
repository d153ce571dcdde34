//! Error types for checkpoint store operations

use crate::checkpoint::{CheckpointId, ThreadId, ThreadStatus};
use thiserror::Error;

/// Result type for checkpoint store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while reading or mutating the store
///
/// The first group describes protocol conditions the caller can act on
/// (re-fetch the pointer and retry, pick another index, ...). The second group
/// is storage-medium failure and is surfaced unchanged.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Thread, checkpoint, blob or write not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write with the same (checkpoint, task, index, channel) already exists
    #[error("Duplicate write: checkpoint {checkpoint_id}, task {task_id}, index {idx}, channel {channel}")]
    DuplicateWrite {
        checkpoint_id: CheckpointId,
        task_id: String,
        idx: i64,
        channel: String,
    },

    /// Pending writes of a building checkpoint changed after the commit was planned
    #[error("Pending writes of checkpoint {0} changed while committing")]
    PendingWritesChanged(CheckpointId),

    /// The target checkpoint has already been committed
    #[error("Checkpoint already finalized: {0}")]
    CheckpointFinalized(CheckpointId),

    /// Parent checkpoint is missing or belongs to another thread
    #[error("Invalid parent: {0}")]
    InvalidParent(String),

    /// Pointer update rejected (stale parent assumption, unrelated branch)
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Thread reached a terminal status
    #[error("Thread {thread_id} is terminated ({status})")]
    ThreadTerminated {
        thread_id: ThreadId,
        status: ThreadStatus,
    },

    /// Blob (key, version) already stored with different content
    #[error("Version conflict for blob {key} at version {version}")]
    VersionConflict { key: String, version: i64 },

    /// Migration version is not the next one in sequence
    #[error("Migration out of order: expected version {expected}, got {actual}")]
    OutOfOrder { expected: i64, actual: i64 },

    /// Migration version was applied before
    #[error("Migration version {0} already applied")]
    AlreadyApplied(i64),

    /// SQL error from the storage engine
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload was written by a different serializer than the reader's
    #[error("Payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Identifier text supplied by a caller does not parse
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Persisted data violates a store invariant
    #[error("Corrupted store: {0}")]
    Corrupted(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the caller can recover by retrying with updated state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::DuplicateWrite { .. }
                | Self::CheckpointFinalized(_)
                | Self::PendingWritesChanged(_)
                | Self::InvalidParent(_)
                | Self::InvalidTransition(_)
                | Self::ThreadTerminated { .. }
                | Self::VersionConflict { .. }
                | Self::OutOfOrder { .. }
                | Self::AlreadyApplied(_)
        )
    }
}
