//! In-memory checkpoint store for development and testing
//!
//! This module provides **[`InMemoryStore`]** - a [`StoreBackend`] that keeps every
//! table in process memory. It implements the full contract (pointer CAS,
//! duplicate-write detection, blob idempotence, ordered migrations) and is the
//! reference the SQLite backend is tested against.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  InMemoryStore (Arc<Inner>, cheap to clone)                 │
//! │                                                             │
//! │  threads      RwLock<HashMap<ThreadId, Thread>>             │
//! │  checkpoints  RwLock<HashMap<CheckpointId, Checkpoint>>     │
//! │  blobs        RwLock<HashMap<BlobKey, BTreeMap<ver, Blob>>> │
//! │  writes       DashMap<CheckpointId,                         │
//! │                       BTreeMap<WriteCursor, WriteRecord>>   │
//! │  schema       Mutex<MemorySchema>   (migration context)     │
//! │  migrations   RwLock<Vec<MigrationRecord>>                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Locks are always taken in the order threads → checkpoints → blobs → writes.
//! Appends hold the checkpoint table for reading while they insert, so a commit
//! (which holds it for writing while it purges) can never interleave with an
//! append to the checkpoint it finalizes. Appends to different building
//! checkpoints only contend on their `DashMap` shard.
//!
//! # Limitations
//!
//! 1. **No Persistence** - All data lost on restart
//! 2. **Single Process** - Cannot share across processes
//! 3. **Memory Bound** - Blob content is kept in RAM

use crate::{
    checkpoint::{
        now_micros, Blob, BlobKey, BlobRef, Checkpoint, CheckpointId, MigrationRecord, NewBlob,
        NewWrite, Thread, ThreadId, ThreadStatus, WriteCursor, WriteRecord,
    },
    commit::CommitPlan,
    error::{Result, StoreError},
    metadata::Document,
    traits::{
        BlobStore, CheckpointStore, FnMigration, Migration, MigrationManager, StoreBackend,
        ThreadRegistry, WriteAheadLog, DEFAULT_PAGE_SIZE,
    },
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Layout of one in-memory table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableLayout {
    /// Column name to default value
    pub columns: BTreeMap<String, Value>,
    pub indexes: BTreeSet<String>,
}

/// Schema catalog of the in-memory store, the context its migrations run on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySchema {
    tables: BTreeMap<String, TableLayout>,
}

impl MemorySchema {
    pub fn create_table(&mut self, table: &str, columns: &[&str]) -> Result<()> {
        if self.tables.contains_key(table) {
            return Err(StoreError::Corrupted(format!("table {table} already exists")));
        }
        let layout = TableLayout {
            columns: columns
                .iter()
                .map(|c| (c.to_string(), Value::Null))
                .collect(),
            indexes: BTreeSet::new(),
        };
        self.tables.insert(table.to_string(), layout);
        Ok(())
    }

    /// Add a column; existing rows read it as `default`
    pub fn add_column(&mut self, table: &str, column: &str, default: Value) -> Result<()> {
        let layout = self.table_mut(table)?;
        if layout.columns.contains_key(column) {
            return Err(StoreError::Corrupted(format!("column {table}.{column} already exists")));
        }
        layout.columns.insert(column.to_string(), default);
        Ok(())
    }

    pub fn add_index(&mut self, table: &str, index: &str) -> Result<()> {
        self.table_mut(table)?.indexes.insert(index.to_string());
        Ok(())
    }

    pub fn table(&self, table: &str) -> Option<&TableLayout> {
        self.tables.get(table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .is_some_and(|layout| layout.columns.contains_key(column))
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TableLayout> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| StoreError::NotFound(format!("table {table}")))
    }
}

type PendingWrites = BTreeMap<WriteCursor, WriteRecord>;

#[derive(Debug)]
struct Inner {
    threads: RwLock<HashMap<ThreadId, Thread>>,
    checkpoints: RwLock<HashMap<CheckpointId, Checkpoint>>,
    blobs: RwLock<HashMap<BlobKey, BTreeMap<i64, Blob>>>,
    writes: DashMap<CheckpointId, PendingWrites>,
    schema: Mutex<MemorySchema>,
    migrations: RwLock<Vec<MigrationRecord>>,
    page_size: usize,
}

/// Thread-safe in-memory checkpoint store
///
/// Clones share the same tables.
///
/// # Example
///
/// ```rust
/// use checkpoint_store::{CheckpointEngine, InMemoryStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = CheckpointEngine::new(InMemoryStore::new());
///     engine.migrate().await?;
///
///     let thread_id = engine.start_thread().await?;
///     let pending = engine.begin(&thread_id).await?;
///     // tasks append writes to `pending.checkpoint_id` ...
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Store whose pending-write listings fetch `page_size` records at a time
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                threads: RwLock::new(HashMap::new()),
                checkpoints: RwLock::new(HashMap::new()),
                blobs: RwLock::new(HashMap::new()),
                writes: DashMap::new(),
                schema: Mutex::new(MemorySchema::default()),
                migrations: RwLock::new(Vec::new()),
                page_size: page_size.max(1),
            }),
        }
    }

    /// Current schema catalog
    pub async fn schema(&self) -> MemorySchema {
        self.inner.schema.lock().await.clone()
    }

    pub async fn thread_count(&self) -> usize {
        self.inner.threads.read().await.len()
    }

    pub async fn checkpoint_count(&self) -> usize {
        self.inner.checkpoints.read().await.len()
    }

    /// Number of stored blob versions across all keys
    pub async fn blob_count(&self) -> usize {
        self.inner.blobs.read().await.values().map(BTreeMap::len).sum()
    }

    pub fn pending_write_count(&self) -> usize {
        self.inner.writes.iter().map(|entry| entry.value().len()).sum()
    }

    /// Clear all data (useful for testing); the schema catalog is kept
    pub async fn clear(&self) {
        let mut threads = self.inner.threads.write().await;
        let mut checkpoints = self.inner.checkpoints.write().await;
        let mut blobs = self.inner.blobs.write().await;
        threads.clear();
        checkpoints.clear();
        blobs.clear();
        self.inner.writes.clear();
    }

    /// Re-insert a write without any check, as a crash before purge would leave it
    #[cfg(test)]
    pub(crate) fn inject_write(&self, record: WriteRecord) {
        self.inner
            .writes
            .entry(record.checkpoint_id)
            .or_default()
            .insert(record.cursor(), record);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn thread_not_found(thread_id: &ThreadId) -> StoreError {
    StoreError::NotFound(format!("thread {thread_id}"))
}

fn blob_not_found(key: &BlobKey, version: i64) -> StoreError {
    StoreError::NotFound(format!("blob {key} at version {version}"))
}

#[async_trait]
impl ThreadRegistry for InMemoryStore {
    async fn create_thread(&self) -> Result<ThreadId> {
        let thread = Thread::new(ThreadId::new());
        let id = thread.id.clone();
        self.inner.threads.write().await.insert(id.clone(), thread);
        debug!(thread_id = %id, "Thread created");
        Ok(id)
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Thread> {
        self.inner
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .ok_or_else(|| thread_not_found(thread_id))
    }

    async fn list_threads(&self, status: Option<ThreadStatus>) -> Result<Vec<Thread>> {
        let threads = self.inner.threads.read().await;
        let mut matching: Vec<Thread> = threads
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(matching)
    }

    async fn advance(&self, thread_id: &ThreadId, checkpoint_id: &CheckpointId) -> Result<()> {
        let mut threads = self.inner.threads.write().await;
        let checkpoints = self.inner.checkpoints.read().await;

        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| thread_not_found(thread_id))?;
        let checkpoint = checkpoints
            .get(checkpoint_id)
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint {checkpoint_id}")))?;

        thread.check_advance(checkpoint)?;
        thread.latest_checkpoint_id = Some(*checkpoint_id);
        debug!(thread_id = %thread_id, checkpoint_id = %checkpoint_id, "Pointer advanced");
        Ok(())
    }

    async fn mark_status(&self, thread_id: &ThreadId, status: ThreadStatus) -> Result<()> {
        let mut threads = self.inner.threads.write().await;
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| thread_not_found(thread_id))?;
        if thread.check_status_change(status)? {
            thread.status = status;
            info!(thread_id = %thread_id, status = %status, "Thread status changed");
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let mut threads = self.inner.threads.write().await;
        let mut checkpoints = self.inner.checkpoints.write().await;
        let mut blobs = self.inner.blobs.write().await;

        if threads.remove(thread_id).is_none() {
            return Err(thread_not_found(thread_id));
        }
        checkpoints.retain(|_, c| &c.thread_id != thread_id);
        blobs.retain(|key, _| &key.thread_id != thread_id);
        self.inner.writes.retain(|_, pending| {
            pending.retain(|_, w| &w.thread_id != thread_id);
            !pending.is_empty()
        });

        info!(thread_id = %thread_id, "Thread deleted");
        Ok(())
    }
}

#[async_trait]
impl WriteAheadLog for InMemoryStore {
    async fn append_write(&self, write: NewWrite) -> Result<WriteRecord> {
        let threads = self.inner.threads.read().await;
        let checkpoints = self.inner.checkpoints.read().await;

        if !threads.contains_key(&write.thread_id) {
            return Err(thread_not_found(&write.thread_id));
        }
        if checkpoints.contains_key(&write.checkpoint_id) {
            return Err(StoreError::CheckpointFinalized(write.checkpoint_id));
        }

        let record = {
            let mut pending = self.inner.writes.entry(write.checkpoint_id).or_default();
            let cursor = write.cursor();
            if pending.contains_key(&cursor) {
                return Err(StoreError::DuplicateWrite {
                    checkpoint_id: write.checkpoint_id,
                    task_id: write.task_id,
                    idx: write.idx,
                    channel: write.channel,
                });
            }
            let record = WriteRecord::from_new(write);
            pending.insert(cursor, record.clone());
            record
        };

        debug!(
            checkpoint_id = %record.checkpoint_id,
            task_id = %record.task_id,
            idx = record.idx,
            channel = %record.channel,
            "Write appended"
        );
        Ok(record)
    }

    async fn pending_page(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        after: Option<&WriteCursor>,
        limit: usize,
    ) -> Result<Vec<WriteRecord>> {
        let Some(pending) = self.inner.writes.get(checkpoint_id) else {
            return Ok(Vec::new());
        };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(pending
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| &record.thread_id == thread_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge(&self, checkpoint_id: &CheckpointId) -> Result<u64> {
        let removed = self
            .inner
            .writes
            .remove(checkpoint_id)
            .map_or(0, |(_, pending)| pending.len() as u64);
        debug!(checkpoint_id = %checkpoint_id, removed, "Pending writes purged");
        Ok(removed)
    }

    async fn pending_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointId>> {
        let mut ids: Vec<CheckpointId> = self
            .inner
            .writes
            .iter()
            .filter(|entry| entry.value().values().any(|w| &w.thread_id == thread_id))
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn page_size(&self) -> usize {
        self.inner.page_size
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn create_checkpoint(
        &self,
        thread_id: &ThreadId,
        parent_id: Option<CheckpointId>,
        kind: &str,
        metadata: Document,
    ) -> Result<CheckpointId> {
        let threads = self.inner.threads.read().await;
        let mut checkpoints = self.inner.checkpoints.write().await;

        if !threads.contains_key(thread_id) {
            return Err(thread_not_found(thread_id));
        }
        let parent = match parent_id {
            Some(parent_id) => {
                let parent = checkpoints.get(&parent_id).ok_or_else(|| {
                    StoreError::InvalidParent(format!("checkpoint {parent_id} does not exist"))
                })?;
                if &parent.thread_id != thread_id {
                    return Err(StoreError::InvalidParent(format!(
                        "checkpoint {parent_id} belongs to thread {}",
                        parent.thread_id
                    )));
                }
                Some(parent)
            }
            None => None,
        };

        let checkpoint = Checkpoint::new(
            CheckpointId::new(),
            thread_id.clone(),
            parent,
            kind,
            metadata,
            parent.map(|p| p.channel_versions.clone()).unwrap_or_default(),
        );
        let id = checkpoint.id;
        checkpoints.insert(id, checkpoint);

        debug!(thread_id = %thread_id, checkpoint_id = %id, "Checkpoint created");
        Ok(id)
    }

    async fn find_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Option<Checkpoint>> {
        Ok(self.inner.checkpoints.read().await.get(checkpoint_id).cloned())
    }

    async fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        let checkpoints = self.inner.checkpoints.read().await;
        let mut matching: Vec<Checkpoint> = checkpoints
            .values()
            .filter(|c| &c.thread_id == thread_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(matching)
    }
}

#[async_trait]
impl BlobStore for InMemoryStore {
    async fn put(&self, blob: NewBlob) -> Result<BlobRef> {
        let mut blobs = self.inner.blobs.write().await;
        let versions = blobs.entry(blob.key.clone()).or_default();

        let existing = versions.get(&blob.version).map(|b| &b.reference);
        let latest = versions.keys().next_back().copied();
        if blob.check_put(existing, latest)? {
            return Ok(blob.reference());
        }

        let reference = blob.reference();
        versions.insert(
            blob.version,
            Blob {
                reference: reference.clone(),
                content: blob.content,
            },
        );
        Ok(reference)
    }

    async fn get(&self, key: &BlobKey, version: i64) -> Result<Blob> {
        self.inner
            .blobs
            .read()
            .await
            .get(key)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| blob_not_found(key, version))
    }

    async fn get_latest(&self, key: &BlobKey, max_version: i64) -> Result<Blob> {
        self.inner
            .blobs
            .read()
            .await
            .get(key)
            .and_then(|versions| versions.range(..=max_version).next_back())
            .map(|(_, blob)| blob.clone())
            .ok_or_else(|| blob_not_found(key, max_version))
    }

    async fn latest_version(&self, key: &BlobKey) -> Result<Option<i64>> {
        Ok(self
            .inner
            .blobs
            .read()
            .await
            .get(key)
            .and_then(|versions| versions.keys().next_back().copied()))
    }

    async fn list_versions(&self, key: &BlobKey) -> Result<Vec<BlobRef>> {
        Ok(self
            .inner
            .blobs
            .read()
            .await
            .get(key)
            .map(|versions| versions.values().map(|b| b.reference.clone()).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MigrationManager for InMemoryStore {
    type Context = MemorySchema;

    async fn current_version(&self) -> Result<i64> {
        Ok(self
            .inner
            .migrations
            .read()
            .await
            .last()
            .map_or(0, |m| m.version))
    }

    async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.inner.migrations.read().await.clone())
    }

    async fn apply(
        &self,
        version: i64,
        migration: &dyn Migration<MemorySchema>,
    ) -> Result<MigrationRecord> {
        // held for the whole migration: migrations never overlap
        let mut schema = self.inner.schema.lock().await;

        let current = self.current_version().await?;
        if version <= current {
            return Err(StoreError::AlreadyApplied(version));
        }
        if version != current + 1 {
            return Err(StoreError::OutOfOrder {
                expected: current + 1,
                actual: version,
            });
        }

        // staged so a failing migration leaves the catalog untouched
        let mut staged = schema.clone();
        migration.up(&mut staged).await?;

        let record = MigrationRecord {
            version,
            description: migration.description().to_string(),
            applied_at: now_micros(),
        };
        *schema = staged;
        self.inner.migrations.write().await.push(record.clone());

        info!(version, description = %record.description, "Migration applied");
        Ok(record)
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn apply_commit(&self, plan: &CommitPlan) -> Result<Checkpoint> {
        let mut threads = self.inner.threads.write().await;
        let mut checkpoints = self.inner.checkpoints.write().await;
        let mut blobs = self.inner.blobs.write().await;

        let checkpoint = &plan.checkpoint;
        let thread = threads
            .get_mut(&checkpoint.thread_id)
            .ok_or_else(|| thread_not_found(&checkpoint.thread_id))?;

        // validate everything first; nothing below may fail once mutation starts
        if checkpoints.contains_key(&checkpoint.id) {
            return Err(StoreError::CheckpointFinalized(checkpoint.id));
        }
        thread.check_advance(checkpoint)?;
        if let Some(parent_id) = checkpoint.parent_id {
            match checkpoints.get(&parent_id) {
                Some(parent) if parent.thread_id == checkpoint.thread_id => {}
                _ => {
                    return Err(StoreError::InvalidParent(format!(
                        "checkpoint {parent_id} is not in thread {}",
                        checkpoint.thread_id
                    )))
                }
            }
        }
        // appends hold the checkpoints read lock, so the pending set is stable here
        match self.inner.writes.get(&checkpoint.id) {
            Some(pending) => plan.check_consumed(pending.keys())?,
            None => plan.check_consumed(std::iter::empty())?,
        }
        let mut inserts = Vec::with_capacity(plan.blobs.len());
        for blob in &plan.blobs {
            let versions = blobs.get(&blob.key);
            let existing = versions
                .and_then(|v| v.get(&blob.version))
                .map(|b| &b.reference);
            let latest = versions.and_then(|v| v.keys().next_back().copied());
            if !blob.check_put(existing, latest)? {
                inserts.push(blob);
            }
        }

        for blob in inserts {
            blobs.entry(blob.key.clone()).or_default().insert(
                blob.version,
                Blob {
                    reference: blob.reference(),
                    content: blob.content.clone(),
                },
            );
        }
        checkpoints.insert(checkpoint.id, checkpoint.clone());
        self.inner.writes.remove(&checkpoint.id);
        thread.latest_checkpoint_id = Some(checkpoint.id);

        Ok(checkpoint.clone())
    }

    async fn unpurged_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let checkpoints = self.inner.checkpoints.read().await;
        let mut ids: Vec<CheckpointId> = self
            .inner
            .writes
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| checkpoints.contains_key(id))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn schema_migrations(&self) -> Vec<Box<dyn Migration<MemorySchema>>> {
        vec![
            schema_step("create checkpoint tables", |schema| {
                schema.create_table(
                    "threads",
                    &["id", "created_at", "status", "latest_checkpoint_id"],
                )?;
                schema.create_table(
                    "checkpoints",
                    &[
                        "id",
                        "thread_id",
                        "parent_checkpoint_id",
                        "type",
                        "metadata_json",
                        "channel_versions_json",
                        "created_at",
                    ],
                )?;
                schema.create_table(
                    "checkpoint_blobs",
                    &["thread_id", "checkpoint_id", "channel", "version", "type", "content"],
                )?;
                schema.create_table(
                    "checkpoint_writes",
                    &[
                        "thread_id",
                        "checkpoint_id",
                        "task_id",
                        "idx",
                        "channel",
                        "type",
                        "content",
                        "written_at",
                    ],
                )
            }),
            schema_step("index parents, pending writes and blob producers", |schema| {
                schema.add_index("checkpoints", "idx_checkpoints_thread_parent")?;
                schema.add_index("checkpoint_writes", "idx_writes_thread_checkpoint")?;
                schema.add_index("checkpoint_blobs", "idx_blobs_checkpoint")
            }),
            schema_step("add blob content digest", |schema| {
                schema.add_column("checkpoint_blobs", "digest", Value::Null)
            }),
        ]
    }
}

fn schema_step<F>(description: &str, apply: F) -> Box<dyn Migration<MemorySchema>>
where
    F: Fn(&mut MemorySchema) -> Result<()> + Send + Sync + 'static,
{
    Box::new(FnMigration::new(description, apply))
}
