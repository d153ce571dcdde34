//! Storage seams of the checkpoint store
//!
//! Each component is an async trait so storage engines can be swapped without
//! touching the commit engine:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  CheckpointEngine<S: StoreBackend>                           │
//! │    commit / resume / recover / get_state                     │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────────────┐
//! │  StoreBackend                                                │
//! │   ├─ ThreadRegistry    threads + latest pointer (CAS)        │
//! │   ├─ WriteAheadLog     pending channel writes                │
//! │   ├─ CheckpointStore   immutable snapshots                   │
//! │   ├─ BlobStore         versioned channel payloads            │
//! │   ├─ MigrationManager  ordered schema versions               │
//! │   └─ apply_commit      steps 3-6 of a commit, atomically     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations: [`InMemoryStore`](crate::memory::InMemoryStore) and
//! [`SqliteStore`](crate::sqlite::SqliteStore).

use crate::{
    checkpoint::{
        Blob, BlobKey, BlobRef, Checkpoint, CheckpointId, MigrationRecord, NewBlob, NewWrite,
        Thread, ThreadId, ThreadStatus, WriteCursor, WriteRecord,
    },
    commit::CommitPlan,
    error::{Result, StoreError},
    metadata::Document,
};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;

/// Default number of pending writes fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Lazy stream of pending writes in replay order
pub type WriteStream<'a> = Pin<Box<dyn Stream<Item = Result<WriteRecord>> + Send + 'a>>;

/// Registry of threads and their canonical checkpoint pointer
#[async_trait]
pub trait ThreadRegistry: Send + Sync {
    /// Allocate a new `active` thread without a checkpoint pointer
    async fn create_thread(&self) -> Result<ThreadId>;

    /// Fetch a thread, `NotFound` if unknown
    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Thread>;

    /// All threads, oldest first, optionally filtered by status
    async fn list_threads(&self, status: Option<ThreadStatus>) -> Result<Vec<Thread>>;

    /// Current pointer, `None` before the first commit
    async fn get_latest(&self, thread_id: &ThreadId) -> Result<Option<CheckpointId>> {
        Ok(self.get_thread(thread_id).await?.latest_checkpoint_id)
    }

    /// Move the pointer to `checkpoint_id`
    ///
    /// The checkpoint must belong to the thread and its parent must equal the
    /// current pointer (both absent for the first checkpoint). Otherwise the call
    /// fails with `InvalidTransition`; terminal threads fail with
    /// `ThreadTerminated`.
    async fn advance(&self, thread_id: &ThreadId, checkpoint_id: &CheckpointId) -> Result<()>;

    /// Change the thread status
    ///
    /// `active` may move to any status. Terminal statuses only accept themselves
    /// again (a no-op); anything else is an `InvalidTransition`.
    async fn mark_status(&self, thread_id: &ThreadId, status: ThreadStatus) -> Result<()>;

    /// Remove a thread together with its checkpoints, blobs and pending writes
    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()>;
}

/// Append-only log of pending channel writes
#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Append one write for a checkpoint under construction
    ///
    /// Fails with `DuplicateWrite` when (checkpoint, task, index, channel) exists
    /// and with `CheckpointFinalized` once the checkpoint has been committed.
    async fn append_write(&self, write: NewWrite) -> Result<WriteRecord>;

    /// One page of pending writes strictly after `after`, in replay order
    async fn pending_page(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        after: Option<&WriteCursor>,
        limit: usize,
    ) -> Result<Vec<WriteRecord>>;

    /// Drop the pending writes of a finalized checkpoint; returns rows removed
    async fn purge(&self, checkpoint_id: &CheckpointId) -> Result<u64>;

    /// Building checkpoints of a thread that still own pending writes
    async fn pending_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointId>>;

    /// Page size used by [`list_pending`](Self::list_pending)
    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }

    /// Pending writes ordered by (task id, index)
    ///
    /// Nothing is read until the stream is polled. Calling again restarts from
    /// the beginning.
    fn list_pending<'a>(
        &'a self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> WriteStream<'a> {
        self.list_pending_from(thread_id, checkpoint_id, None)
    }

    /// Resume a pending-write listing after `from`
    fn list_pending_from<'a>(
        &'a self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        from: Option<WriteCursor>,
    ) -> WriteStream<'a> {
        let page_size = self.page_size().max(1);
        let thread_id = thread_id.clone();
        let checkpoint_id = *checkpoint_id;
        let pager = Pager {
            cursor: from,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        Box::pin(stream::try_unfold(pager, move |mut pager| {
            let thread_id = thread_id.clone();
            async move {
                if pager.buffered.is_empty() && !pager.exhausted {
                    let page = self
                        .pending_page(&thread_id, &checkpoint_id, pager.cursor.as_ref(), page_size)
                        .await?;
                    pager.exhausted = page.len() < page_size;
                    if let Some(last) = page.last() {
                        pager.cursor = Some(last.cursor());
                    }
                    pager.buffered.extend(page);
                }
                let next = pager.buffered.pop_front();
                Ok::<_, StoreError>(next.map(|record| (record, pager)))
            }
        }))
    }
}

struct Pager {
    cursor: Option<WriteCursor>,
    buffered: VecDeque<WriteRecord>,
    exhausted: bool,
}

/// Immutable checkpoint snapshots
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new checkpoint without touching the thread pointer
    ///
    /// Fails with `InvalidParent` when `parent_id` is set but missing or owned by
    /// another thread. The checkpoint inherits the parent's channel versions.
    async fn create_checkpoint(
        &self,
        thread_id: &ThreadId,
        parent_id: Option<CheckpointId>,
        kind: &str,
        metadata: Document,
    ) -> Result<CheckpointId>;

    /// Fetch a checkpoint if it exists
    async fn find_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a thread in creation order, branches included
    async fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>>;

    /// Fetch a checkpoint, `NotFound` if absent
    async fn get_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Checkpoint> {
        self.find_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    /// Walk parent pointers from `from` to the root; oldest first
    async fn list_chain(
        &self,
        thread_id: &ThreadId,
        from: &CheckpointId,
    ) -> Result<Vec<Checkpoint>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(*from);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(StoreError::Corrupted(format!(
                    "parent cycle through checkpoint {id}"
                )));
            }
            let checkpoint = match self.find_checkpoint(&id).await? {
                Some(checkpoint) => checkpoint,
                None if id == *from => {
                    return Err(StoreError::NotFound(format!("checkpoint {id}")))
                }
                None => {
                    return Err(StoreError::Corrupted(format!("missing parent checkpoint {id}")))
                }
            };
            if checkpoint.thread_id != *thread_id {
                return Err(if id == *from {
                    StoreError::NotFound(format!("checkpoint {id} in thread {thread_id}"))
                } else {
                    StoreError::Corrupted(format!("parent {id} crosses into another thread"))
                });
            }
            next = checkpoint.parent_id;
            chain.push(checkpoint);
        }

        chain.reverse();
        Ok(chain)
    }
}

/// Versioned, content-addressed channel payloads
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `(key, version)`
    ///
    /// Repeating a put with identical content is a no-op returning the same
    /// reference; different content fails with `VersionConflict`.
    async fn put(&self, blob: NewBlob) -> Result<BlobRef>;

    /// Exact version, `NotFound` if absent
    async fn get(&self, key: &BlobKey, version: i64) -> Result<Blob>;

    /// Highest version `<= max_version`, `NotFound` if none
    async fn get_latest(&self, key: &BlobKey, max_version: i64) -> Result<Blob>;

    /// Highest stored version of a key
    async fn latest_version(&self, key: &BlobKey) -> Result<Option<i64>>;

    /// All stored versions of a key, ascending
    async fn list_versions(&self, key: &BlobKey) -> Result<Vec<BlobRef>>;
}

/// A schema transformation run inside the migration's unit of work
#[async_trait]
pub trait Migration<C: Send>: Send + Sync {
    fn description(&self) -> &str;

    async fn up(&self, ctx: &mut C) -> Result<()>;
}

/// Migration built from a synchronous closure
pub struct FnMigration<F> {
    description: String,
    apply: F,
}

impl<F> FnMigration<F> {
    pub fn new(description: impl Into<String>, apply: F) -> Self {
        Self {
            description: description.into(),
            apply,
        }
    }
}

#[async_trait]
impl<C, F> Migration<C> for FnMigration<F>
where
    C: Send,
    F: Fn(&mut C) -> Result<()> + Send + Sync,
{
    fn description(&self) -> &str {
        &self.description
    }

    async fn up(&self, ctx: &mut C) -> Result<()> {
        (self.apply)(ctx)
    }
}

/// Ordered, append-only schema versions
#[async_trait]
pub trait MigrationManager: Send + Sync {
    /// What a migration operates on
    type Context: Send;

    /// Highest applied version, 0 if none
    async fn current_version(&self) -> Result<i64>;

    /// Applied migrations in version order
    async fn applied(&self) -> Result<Vec<MigrationRecord>>;

    /// Run `migration` as `version`, atomically with its record
    ///
    /// `AlreadyApplied` for a version at or below the current one (nothing
    /// runs), `OutOfOrder` unless `version == current + 1`.
    async fn apply(
        &self,
        version: i64,
        migration: &dyn Migration<Self::Context>,
    ) -> Result<MigrationRecord>;

    /// Apply every missing entry of `migrations`, numbered from 1
    async fn migrate_to_latest(
        &self,
        migrations: &[Box<dyn Migration<Self::Context>>],
    ) -> Result<i64> {
        let current = self.current_version().await?;
        for (offset, migration) in migrations.iter().enumerate() {
            let version = offset as i64 + 1;
            if version <= current {
                continue;
            }
            match self.apply(version, migration.as_ref()).await {
                // another process got there first
                Ok(_) | Err(StoreError::AlreadyApplied(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.current_version().await
    }
}

/// Complete storage engine used by [`CheckpointEngine`](crate::engine::CheckpointEngine)
#[async_trait]
pub trait StoreBackend:
    ThreadRegistry + WriteAheadLog + CheckpointStore + BlobStore + MigrationManager
{
    /// Persist blobs and checkpoint, purge pending writes and advance the thread
    /// pointer as one unit
    ///
    /// The pointer must still equal `plan.checkpoint.parent_id`; otherwise
    /// nothing is written and the call fails with `InvalidTransition`. The
    /// pending writes must be exactly `plan.consumed`, checked in the same
    /// atomic section; otherwise the call fails with `PendingWritesChanged`.
    async fn apply_commit(&self, plan: &CommitPlan) -> Result<Checkpoint>;

    /// Finalized checkpoints that still own pending writes
    async fn unpurged_checkpoints(&self) -> Result<Vec<CheckpointId>>;

    /// Built-in schema migrations, version 1 first
    fn schema_migrations(&self) -> Vec<Box<dyn Migration<Self::Context>>>;
}
