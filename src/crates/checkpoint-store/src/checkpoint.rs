//! Core data structures of the checkpoint store
//!
//! This module defines the persisted records: **[`Thread`]**, **[`Checkpoint`]**,
//! **[`WriteRecord`]**, blob references and **[`MigrationRecord`]**, plus the
//! identifier newtypes that tie them together.
//!
//! # Overview
//!
//! ```text
//! Thread ──latest──► Checkpoint ──parent──► Checkpoint ──► ... ──► root
//!                        │
//!                        └─ channel_versions: { "vol": 3, "seg": 1 }
//!                                 │
//!                                 ▼
//!                     BlobKey(thread, "vol") @ version ≤ 3
//!
//! WriteRecord(thread, building checkpoint, task, idx, channel)   (pending)
//! ```
//!
//! Relations are identifier lookups into flat tables, never in-memory object
//! graphs: a checkpoint only knows its parent's id, a thread only knows the id of
//! its latest canonical checkpoint.

use crate::error::{Result, StoreError};
use crate::metadata::{Document, TypedMetadata};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque thread identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Allocate a fresh random thread id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ThreadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ThreadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Checkpoint identifier
///
/// UUID v7, so identifiers sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    /// Allocate a new, time-ordered checkpoint id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CheckpointId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StoreError::InvalidId(format!("checkpoint id {s}: {e}")))
    }
}

impl From<Uuid> for CheckpointId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    /// Still progressing; the pointer may advance
    Active,
    /// Finished successfully (terminal)
    Completed,
    /// Finished with a failure (terminal)
    Failed,
}

impl ThreadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupted(format!("unknown thread status: {other}"))),
        }
    }
}

/// A logical, independently progressing computation flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub created_at: DateTime<Utc>,
    pub status: ThreadStatus,
    /// Latest canonical checkpoint, `None` until the first commit
    pub latest_checkpoint_id: Option<CheckpointId>,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            created_at: now_micros(),
            status: ThreadStatus::Active,
            latest_checkpoint_id: None,
        }
    }

    /// Check that the pointer may move to `checkpoint`
    pub fn check_advance(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.status.is_terminal() {
            return Err(StoreError::ThreadTerminated {
                thread_id: self.id.clone(),
                status: self.status,
            });
        }
        if checkpoint.thread_id != self.id {
            return Err(StoreError::InvalidTransition(format!(
                "checkpoint {} belongs to thread {}, not {}",
                checkpoint.id, checkpoint.thread_id, self.id
            )));
        }
        if checkpoint.parent_id != self.latest_checkpoint_id {
            return Err(StoreError::InvalidTransition(format!(
                "checkpoint {} has parent {}, thread {} points at {}",
                checkpoint.id,
                display_pointer(checkpoint.parent_id),
                self.id,
                display_pointer(self.latest_checkpoint_id)
            )));
        }
        Ok(())
    }

    /// Check a status change; `Ok(false)` when it is a no-op
    pub fn check_status_change(&self, status: ThreadStatus) -> Result<bool> {
        if self.status == status {
            return Ok(false);
        }
        if self.status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "thread {} is {} and cannot become {}",
                self.id, self.status, status
            )));
        }
        Ok(true)
    }
}

pub(crate) fn display_pointer(pointer: Option<CheckpointId>) -> String {
    pointer.map_or_else(|| "<none>".to_string(), |id| id.to_string())
}

/// Mapping from channel name to the blob version visible at a checkpoint
pub type ChannelVersions = BTreeMap<String, i64>;

/// Immutable state snapshot of a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub thread_id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,
    /// Type tag identifying the producer and shape of `metadata`
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: Document,
    /// Blob version of every channel visible at this checkpoint
    #[serde(default)]
    pub channel_versions: ChannelVersions,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint row, clamping `created_at` after the parent's
    pub fn new(
        id: CheckpointId,
        thread_id: ThreadId,
        parent: Option<&Checkpoint>,
        kind: impl Into<String>,
        metadata: Document,
        channel_versions: ChannelVersions,
    ) -> Self {
        Self {
            id,
            thread_id,
            parent_id: parent.map(|p| p.id),
            kind: kind.into(),
            metadata,
            channel_versions,
            created_at: creation_time_after(parent.map(|p| p.created_at)),
        }
    }

    /// Blob keys and versions referenced by this checkpoint
    pub fn blob_refs(&self) -> impl Iterator<Item = (BlobKey, i64)> + '_ {
        self.channel_versions
            .iter()
            .map(|(channel, version)| (BlobKey::new(self.thread_id.clone(), channel), *version))
    }

    /// Decode the metadata document according to the type tag
    pub fn typed_metadata(&self) -> TypedMetadata {
        TypedMetadata::decode(&self.kind, &self.metadata)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Current time at the microsecond precision the stores persist
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Current time, strictly after `after` when given
pub(crate) fn creation_time_after(after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now_micros();
    match after {
        Some(parent) if now <= parent => parent + Duration::microseconds(1),
        _ => now,
    }
}

/// Blob key: one logical channel of one thread
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey {
    pub thread_id: ThreadId,
    pub channel: String,
}

impl BlobKey {
    pub fn new(thread_id: ThreadId, channel: impl Into<String>) -> Self {
        Self {
            thread_id,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.thread_id, self.channel)
    }
}

/// Blob to be stored under `(key, version)`
#[derive(Debug, Clone, PartialEq)]
pub struct NewBlob {
    pub key: BlobKey,
    pub version: i64,
    pub kind: String,
    /// Checkpoint that produced this version
    pub checkpoint_id: Option<CheckpointId>,
    pub content: Vec<u8>,
}

impl NewBlob {
    pub fn digest(&self) -> String {
        content_digest(&self.content)
    }

    /// Reference this blob will have once stored
    pub fn reference(&self) -> BlobRef {
        BlobRef {
            key: self.key.clone(),
            version: self.version,
            kind: self.kind.clone(),
            checkpoint_id: self.checkpoint_id,
            size: self.content.len(),
            digest: self.digest(),
        }
    }

    /// Decide how a put behaves against what is stored for the key
    ///
    /// `existing` is the stored reference at this exact version, `latest` the
    /// highest stored version. Returns `Ok(true)` when an identical blob is
    /// already stored, `Ok(false)` when the blob must be inserted.
    pub fn check_put(&self, existing: Option<&BlobRef>, latest: Option<i64>) -> Result<bool> {
        let conflict = || StoreError::VersionConflict {
            key: self.key.to_string(),
            version: self.version,
        };
        match existing {
            Some(stored) if stored.digest == self.digest() && stored.kind == self.kind => Ok(true),
            Some(_) => Err(conflict()),
            // versions only move forward
            None if self.version < 1 || latest.is_some_and(|v| v > self.version) => Err(conflict()),
            None => Ok(false),
        }
    }
}

/// Reference to a stored blob version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: BlobKey,
    pub version: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
    pub size: usize,
    /// Hex SHA-256 of the content
    pub digest: String,
}

/// A stored blob with its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub reference: BlobRef,
    pub content: Vec<u8>,
}

/// Hex-encoded SHA-256 digest of blob content
pub fn content_digest(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Position of a write in replay order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteCursor {
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
}

/// Pending channel write to append to the log
#[derive(Debug, Clone, PartialEq)]
pub struct NewWrite {
    pub thread_id: ThreadId,
    /// Checkpoint being built
    pub checkpoint_id: CheckpointId,
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    pub kind: String,
    pub payload: Vec<u8>,
}

impl NewWrite {
    pub fn cursor(&self) -> WriteCursor {
        WriteCursor {
            task_id: self.task_id.clone(),
            idx: self.idx,
            channel: self.channel.clone(),
        }
    }
}

/// Pending write stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub thread_id: ThreadId,
    pub checkpoint_id: CheckpointId,
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Vec<u8>,
    pub written_at: DateTime<Utc>,
}

impl WriteRecord {
    pub fn from_new(write: NewWrite) -> Self {
        Self {
            thread_id: write.thread_id,
            checkpoint_id: write.checkpoint_id,
            task_id: write.task_id,
            idx: write.idx,
            channel: write.channel,
            kind: write.kind,
            payload: write.payload,
            written_at: now_micros(),
        }
    }

    pub fn cursor(&self) -> WriteCursor {
        WriteCursor {
            task_id: self.task_id.clone(),
            idx: self.idx,
            channel: self.channel.clone(),
        }
    }
}

/// Applied schema migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}
