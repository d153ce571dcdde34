//! Commit engine
//!
//! [`CheckpointEngine`] drives a [`StoreBackend`] through the checkpoint life
//! cycle of a thread:
//!
//! ```text
//! start_thread ─► begin ─► append* ─► commit ─► begin ─► ...
//!                   │                   │
//!                   │                   ├─ InvalidTransition: rebase + retry
//!                   │                   └─ crash: recover() finishes the commit
//!                   └─ resume(): latest state + in-flight writes
//! ```
//!
//! Planning is pure ([`plan_commit`]); the backend applies the plan atomically.
//! Committing a checkpoint that already exists is treated as a retry of the
//! same commit and completes whatever a crash left behind.

use crate::{
    checkpoint::{
        Blob, BlobKey, ChannelVersions, Checkpoint, CheckpointId, NewWrite, Thread, ThreadId,
        ThreadStatus, WriteRecord,
    },
    commit::{last_writes, plan_commit, replay_blobs, CommitPlan, CommitRequest, PendingCheckpoint},
    config::StoreConfig,
    error::{Result, StoreError},
    retry::RetryPolicy,
    serializer::SerializerProtocol,
    traits::{BlobStore, StoreBackend},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Materialized state of a thread at one checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub checkpoint: Checkpoint,
    /// Blob visible for every channel recorded by the checkpoint
    pub channels: BTreeMap<String, Blob>,
}

impl StateSnapshot {
    pub fn channel(&self, channel: &str) -> Option<&Blob> {
        self.channels.get(channel)
    }

    /// Decode a channel with `serializer`, `None` if the channel is absent
    ///
    /// The blob must carry the serializer's type tag.
    pub fn value<T, P>(&self, channel: &str, serializer: &P) -> Result<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
        P: SerializerProtocol,
    {
        self.channel(channel)
            .map(|blob| serializer.decode_tagged(&blob.reference.kind, &blob.content))
            .transpose()
    }
}

/// Building checkpoint that owns pending writes but was never committed
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightCheckpoint {
    /// Ready to commit on top of the current pointer
    pub pending: PendingCheckpoint,
    /// Pending writes in replay order
    pub writes: Vec<WriteRecord>,
}

impl InFlightCheckpoint {
    /// Authoritative write per channel
    pub fn projection(&self) -> BTreeMap<&str, &WriteRecord> {
        last_writes(&self.writes)
    }
}

/// Everything needed to continue a thread after a restart
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub thread: Thread,
    /// State at the latest canonical checkpoint
    pub latest: Option<StateSnapshot>,
    pub in_flight: Vec<InFlightCheckpoint>,
}

/// Checkpoint whose leftover writes could not be reconciled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConflict {
    pub checkpoint_id: CheckpointId,
    pub reason: String,
}

/// Outcome of [`CheckpointEngine::recover`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Finalized checkpoints whose interrupted commit was completed
    pub recovered: Vec<CheckpointId>,
    pub conflicts: Vec<RecoveryConflict>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Checkpoint life cycle on top of a [`StoreBackend`]
///
/// # Example
///
/// ```rust
/// use checkpoint_store::{CheckpointEngine, CommitRequest, Document, InMemoryStore};
///
/// #[tokio::main]
/// async fn main() -> checkpoint_store::Result<()> {
///     let engine = CheckpointEngine::new(InMemoryStore::new());
///     engine.migrate().await?;
///
///     let thread_id = engine.start_thread().await?;
///     let pending = engine.begin(&thread_id).await?;
///     engine
///         .append(&pending, "convert", 0, "volume", "path", b"nifti/t1.nii.gz".to_vec())
///         .await?;
///
///     let checkpoint = engine
///         .commit(CommitRequest::new(&pending, "input", Document::new()))
///         .await?;
///     assert_eq!(checkpoint.channel_versions["volume"], 1);
///
///     let state = engine.get_state(&thread_id).await?.expect("committed");
///     assert_eq!(state.channels["volume"].content, b"nifti/t1.nii.gz");
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct CheckpointEngine<S> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S> Clone for CheckpointEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
        }
    }
}

impl<S: StoreBackend> CheckpointEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, &StoreConfig::default())
    }

    /// Engine whose commit retries follow `config.max_commit_attempts`
    pub fn with_config(store: S, config: &StoreConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    pub fn from_arc(store: Arc<S>, config: &StoreConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::new(config.max_commit_attempts),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply the backend's built-in schema migrations; returns the schema version
    pub async fn migrate(&self) -> Result<i64> {
        let version = self
            .store
            .migrate_to_latest(&self.store.schema_migrations())
            .await?;
        info!(version, "Schema migrated");
        Ok(version)
    }

    pub async fn start_thread(&self) -> Result<ThreadId> {
        let thread_id = self.store.create_thread().await?;
        info!(thread_id = %thread_id, "Thread started");
        Ok(thread_id)
    }

    /// Allocate a building checkpoint on top of the current pointer
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn begin(&self, thread_id: &ThreadId) -> Result<PendingCheckpoint> {
        let thread = self.store.get_thread(thread_id).await?;
        if thread.status.is_terminal() {
            return Err(StoreError::ThreadTerminated {
                thread_id: thread.id,
                status: thread.status,
            });
        }

        let pending = PendingCheckpoint {
            thread_id: thread.id,
            checkpoint_id: CheckpointId::new(),
            parent: thread.latest_checkpoint_id,
        };
        debug!(checkpoint_id = %pending.checkpoint_id, "Checkpoint begun");
        Ok(pending)
    }

    /// Append one raw channel write to a building checkpoint
    pub async fn append(
        &self,
        pending: &PendingCheckpoint,
        task_id: impl Into<String>,
        idx: i64,
        channel: impl Into<String>,
        kind: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<WriteRecord> {
        self.store
            .append_write(NewWrite {
                thread_id: pending.thread_id.clone(),
                checkpoint_id: pending.checkpoint_id,
                task_id: task_id.into(),
                idx,
                channel: channel.into(),
                kind: kind.into(),
                payload,
            })
            .await
    }

    /// Serialize `value` and append it; the serializer's tag becomes the write type
    pub async fn append_value<T, P>(
        &self,
        pending: &PendingCheckpoint,
        task_id: impl Into<String>,
        idx: i64,
        channel: impl Into<String>,
        serializer: &P,
        value: &T,
    ) -> Result<WriteRecord>
    where
        T: Serialize + Sync,
        P: SerializerProtocol,
    {
        let payload = serializer.dumps(value)?;
        self.append(pending, task_id, idx, channel, serializer.type_tag(), payload)
            .await
    }

    /// Finalize a building checkpoint
    ///
    /// Fails with `InvalidTransition` when the pointer no longer equals
    /// `request.expected_parent`; nothing is written in that case.
    #[instrument(
        skip_all,
        fields(thread_id = %request.thread_id, checkpoint_id = %request.checkpoint_id)
    )]
    pub async fn commit(&self, request: CommitRequest) -> Result<Checkpoint> {
        if let Some(existing) = self.store.find_checkpoint(&request.checkpoint_id).await? {
            return self.retry_finalized(&request, existing).await;
        }

        let parent = match request.expected_parent {
            Some(parent_id) => Some(
                self.store
                    .find_checkpoint(&parent_id)
                    .await?
                    .filter(|parent| parent.thread_id == request.thread_id)
                    .ok_or_else(|| {
                        StoreError::InvalidParent(format!(
                            "checkpoint {parent_id} is not in thread {}",
                            request.thread_id
                        ))
                    })?,
            ),
            None => None,
        };

        let mut replans = 0;
        loop {
            let plan = self.plan(&request, parent.as_ref()).await?;
            match self.store.apply_commit(&plan).await {
                Ok(checkpoint) => {
                    info!(
                        writes = plan.consumed.len(),
                        channels = plan.blobs.len(),
                        "Checkpoint committed"
                    );
                    return Ok(checkpoint);
                }
                Err(StoreError::PendingWritesChanged(_)) if self.retry.should_retry(replans + 1) => {
                    replans += 1;
                    debug!(replans, "Writes appended while committing, re-planning");
                }
                // a concurrent call committed the same checkpoint first
                Err(StoreError::CheckpointFinalized(id)) => {
                    let existing = self.store.get_checkpoint(&id).await?;
                    return self.retry_finalized(&request, existing).await;
                }
                Err(e @ StoreError::InvalidTransition(_)) => {
                    warn!(error = %e, "Commit rejected");
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Snapshot the pending writes of `request` and plan their commit
    async fn plan(&self, request: &CommitRequest, parent: Option<&Checkpoint>) -> Result<CommitPlan> {
        let writes: Vec<WriteRecord> = self
            .store
            .list_pending(&request.thread_id, &request.checkpoint_id)
            .try_collect()
            .await?;

        let channels: BTreeSet<&str> = writes.iter().map(|w| w.channel.as_str()).collect();
        let mut latest_versions = ChannelVersions::new();
        for channel in channels {
            let key = BlobKey::new(request.thread_id.clone(), channel);
            if let Some(version) = self.store.latest_version(&key).await? {
                latest_versions.insert(channel.to_string(), version);
            }
        }

        Ok(plan_commit(request, parent, &writes, &latest_versions))
    }

    /// [`commit`](Self::commit), rebasing onto the new pointer after each lost race
    pub async fn commit_with_retry(&self, mut request: CommitRequest) -> Result<Checkpoint> {
        let mut failures = 0;
        loop {
            match self.commit(request.clone()).await {
                Err(StoreError::InvalidTransition(reason)) if self.retry.should_retry(failures + 1) => {
                    let delay = self.retry.delay(failures);
                    failures += 1;
                    warn!(
                        thread_id = %request.thread_id,
                        checkpoint_id = %request.checkpoint_id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Rebasing commit onto the new pointer"
                    );
                    tokio::time::sleep(delay).await;

                    let thread = self.store.get_thread(&request.thread_id).await?;
                    request = request.rebase(thread.latest_checkpoint_id);
                }
                other => return other,
            }
        }
    }

    async fn retry_finalized(
        &self,
        request: &CommitRequest,
        existing: Checkpoint,
    ) -> Result<Checkpoint> {
        if existing.thread_id != request.thread_id || existing.parent_id != request.expected_parent
        {
            return Err(StoreError::CheckpointFinalized(existing.id));
        }
        debug!(checkpoint_id = %existing.id, "Checkpoint already committed");
        self.complete_finalized(existing).await
    }

    /// Finish the tail of an interrupted commit of `checkpoint`
    ///
    /// Leftover writes must match the blob versions the checkpoint recorded;
    /// they are then purged and the pointer advanced if it still points at the
    /// parent.
    async fn complete_finalized(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let leftovers: Vec<WriteRecord> = self
            .store
            .list_pending(&checkpoint.thread_id, &checkpoint.id)
            .try_collect()
            .await?;
        if !leftovers.is_empty() {
            for blob in replay_blobs(&checkpoint, &leftovers)? {
                self.store.put(blob).await?;
            }
            let purged = self.store.purge(&checkpoint.id).await?;
            info!(checkpoint_id = %checkpoint.id, purged, "Leftover writes purged");
        }

        let thread = self.store.get_thread(&checkpoint.thread_id).await?;
        if thread.status == ThreadStatus::Active
            && thread.latest_checkpoint_id != Some(checkpoint.id)
            && thread.latest_checkpoint_id == checkpoint.parent_id
        {
            self.store.advance(&thread.id, &checkpoint.id).await?;
            info!(thread_id = %thread.id, checkpoint_id = %checkpoint.id, "Pointer advanced");
        }
        Ok(checkpoint)
    }

    /// State at the latest canonical checkpoint, `None` before the first commit
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn get_state(&self, thread_id: &ThreadId) -> Result<Option<StateSnapshot>> {
        match self.store.get_thread(thread_id).await?.latest_checkpoint_id {
            Some(checkpoint_id) => Ok(Some(self.state_at(&checkpoint_id).await?)),
            None => Ok(None),
        }
    }

    /// State at any checkpoint, canonical or not
    pub async fn state_at(&self, checkpoint_id: &CheckpointId) -> Result<StateSnapshot> {
        let checkpoint = self.store.get_checkpoint(checkpoint_id).await?;
        let mut channels = BTreeMap::new();
        for (key, version) in checkpoint.blob_refs() {
            let blob = BlobStore::get_latest(&*self.store, &key, version).await?;
            channels.insert(key.channel, blob);
        }
        Ok(StateSnapshot {
            checkpoint,
            channels,
        })
    }

    /// Latest state plus the writes of every building checkpoint never committed
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn resume(&self, thread_id: &ThreadId) -> Result<ResumePoint> {
        let thread = self.store.get_thread(thread_id).await?;
        let latest = match thread.latest_checkpoint_id {
            Some(checkpoint_id) => Some(self.state_at(&checkpoint_id).await?),
            None => None,
        };

        let mut in_flight = Vec::new();
        for checkpoint_id in self.store.pending_checkpoints(thread_id).await? {
            // finalized ones are left to recover()
            if self.store.find_checkpoint(&checkpoint_id).await?.is_some() {
                continue;
            }
            let writes: Vec<WriteRecord> = self
                .store
                .list_pending(thread_id, &checkpoint_id)
                .try_collect()
                .await?;
            in_flight.push(InFlightCheckpoint {
                pending: PendingCheckpoint {
                    thread_id: thread.id.clone(),
                    checkpoint_id,
                    parent: thread.latest_checkpoint_id,
                },
                writes,
            });
        }

        debug!(in_flight = in_flight.len(), "Resume point built");
        Ok(ResumePoint {
            thread,
            latest,
            in_flight,
        })
    }

    /// Canonical chain of a thread, root first
    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        match self.store.get_thread(thread_id).await?.latest_checkpoint_id {
            Some(latest) => self.store.list_chain(thread_id, &latest).await,
            None => Ok(Vec::new()),
        }
    }

    /// Complete every commit interrupted between finalization and purge
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for checkpoint_id in self.store.unpurged_checkpoints().await? {
            let checkpoint = self.store.get_checkpoint(&checkpoint_id).await?;
            match self.complete_finalized(checkpoint).await {
                Ok(_) => report.recovered.push(checkpoint_id),
                Err(e) if e.is_recoverable() => {
                    warn!(checkpoint_id = %checkpoint_id, error = %e, "Recovery conflict");
                    report.conflicts.push(RecoveryConflict {
                        checkpoint_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            recovered = report.recovered.len(),
            conflicts = report.conflicts.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    pub async fn mark_status(&self, thread_id: &ThreadId, status: ThreadStatus) -> Result<()> {
        self.store.mark_status(thread_id, status).await
    }

    /// Remove a thread with its checkpoints, blobs and pending writes
    pub async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        self.store.delete_thread(thread_id).await
    }
}
