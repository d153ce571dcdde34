//! Commit planning
//!
//! Turning pending writes into a checkpoint is split in two halves:
//!
//! 1. **Planning** (this module) - a pure function of the pending writes, the
//!    parent checkpoint and the latest stored blob versions. Writes are grouped by
//!    channel and the last write wins: the highest index is authoritative, ties
//!    at the same index go to the greatest task id (the later one in replay
//!    order).
//! 2. **Applying** - [`StoreBackend::apply_commit`](crate::traits::StoreBackend::apply_commit)
//!    persists the planned blobs and checkpoint, purges the writes and advances
//!    the pointer atomically. The plan records which writes it consumed; a
//!    backend that finds a different pending set refuses the plan with
//!    [`StoreError::PendingWritesChanged`] so no acknowledged write is dropped.
//!
//! Because planning is deterministic, a commit interrupted before its purge can
//! be re-planned and re-applied safely.

use crate::checkpoint::{
    BlobKey, ChannelVersions, Checkpoint, CheckpointId, NewBlob, ThreadId, WriteCursor,
    WriteRecord,
};
use crate::error::{Result, StoreError};
use crate::metadata::{Document, TypedMetadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Checkpoint under construction: the target of pending writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCheckpoint {
    pub thread_id: ThreadId,
    pub checkpoint_id: CheckpointId,
    /// Pointer observed when the checkpoint was begun
    pub parent: Option<CheckpointId>,
}

/// Request to finalize a pending checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub thread_id: ThreadId,
    pub checkpoint_id: CheckpointId,
    /// Pointer the caller assumes is current
    pub expected_parent: Option<CheckpointId>,
    pub kind: String,
    pub metadata: Document,
}

impl CommitRequest {
    pub fn new(pending: &PendingCheckpoint, kind: impl Into<String>, metadata: Document) -> Self {
        Self {
            thread_id: pending.thread_id.clone(),
            checkpoint_id: pending.checkpoint_id,
            expected_parent: pending.parent,
            kind: kind.into(),
            metadata,
        }
    }

    pub fn typed(pending: &PendingCheckpoint, metadata: &TypedMetadata) -> Self {
        let (kind, document) = metadata.encode();
        Self::new(pending, kind, document)
    }

    /// Same request assuming a different parent
    pub fn rebase(mut self, parent: Option<CheckpointId>) -> Self {
        self.expected_parent = parent;
        self
    }
}

/// Everything `apply_commit` writes
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPlan {
    pub checkpoint: Checkpoint,
    pub blobs: Vec<NewBlob>,
    /// Pending writes folded into `blobs`; the log must hold exactly these
    pub consumed: BTreeSet<WriteCursor>,
}

impl CommitPlan {
    pub fn expected_parent(&self) -> Option<CheckpointId> {
        self.checkpoint.parent_id
    }

    /// Fail unless `pending` is the write set this plan was built from
    pub fn check_consumed<'a, I>(&self, pending: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a WriteCursor>,
    {
        let mut seen = 0;
        for cursor in pending {
            if !self.consumed.contains(cursor) {
                return Err(StoreError::PendingWritesChanged(self.checkpoint.id));
            }
            seen += 1;
        }
        if seen != self.consumed.len() {
            return Err(StoreError::PendingWritesChanged(self.checkpoint.id));
        }
        Ok(())
    }
}

/// Authoritative write for every channel
pub fn last_writes(writes: &[WriteRecord]) -> BTreeMap<&str, &WriteRecord> {
    let mut winners: BTreeMap<&str, &WriteRecord> = BTreeMap::new();
    for write in writes {
        winners
            .entry(write.channel.as_str())
            .and_modify(|current| {
                if (write.idx, write.task_id.as_str()) > (current.idx, current.task_id.as_str()) {
                    *current = write;
                }
            })
            .or_insert(write);
    }
    winners
}

/// Plan a commit of `writes` on top of `parent`
///
/// `latest_versions` holds the highest stored blob version of each written
/// channel; every written channel gets the next version after both that and the
/// parent's recorded version.
pub fn plan_commit(
    request: &CommitRequest,
    parent: Option<&Checkpoint>,
    writes: &[WriteRecord],
    latest_versions: &ChannelVersions,
) -> CommitPlan {
    let mut channel_versions = parent
        .map(|p| p.channel_versions.clone())
        .unwrap_or_default();

    let mut blobs = Vec::new();
    for (channel, write) in last_writes(writes) {
        let stored = latest_versions.get(channel).copied().unwrap_or(0);
        let recorded = channel_versions.get(channel).copied().unwrap_or(0);
        let version = stored.max(recorded) + 1;

        channel_versions.insert(channel.to_string(), version);
        blobs.push(NewBlob {
            key: BlobKey::new(request.thread_id.clone(), channel),
            version,
            kind: write.kind.clone(),
            checkpoint_id: Some(request.checkpoint_id),
            content: write.payload.clone(),
        });
    }

    let checkpoint = Checkpoint::new(
        request.checkpoint_id,
        request.thread_id.clone(),
        parent,
        request.kind.clone(),
        request.metadata.clone(),
        channel_versions,
    );

    CommitPlan {
        checkpoint,
        blobs,
        consumed: writes.iter().map(WriteRecord::cursor).collect(),
    }
}

/// Blobs that leftover writes of a finalized checkpoint must match
///
/// Used when re-running an interrupted commit: each channel maps to the version
/// the checkpoint recorded for it.
pub fn replay_blobs(checkpoint: &Checkpoint, writes: &[WriteRecord]) -> Result<Vec<NewBlob>> {
    last_writes(writes)
        .into_iter()
        .map(|(channel, write)| {
            let key = BlobKey::new(checkpoint.thread_id.clone(), channel);
            let version = checkpoint
                .channel_versions
                .get(channel)
                .copied()
                .ok_or_else(|| StoreError::VersionConflict {
                    key: key.to_string(),
                    version: 0,
                })?;
            Ok(NewBlob {
                key,
                version,
                kind: write.kind.clone(),
                checkpoint_id: Some(checkpoint.id),
                content: write.payload.clone(),
            })
        })
        .collect()
}
