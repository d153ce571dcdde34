//! SQLite checkpoint store
//!
//! Durable [`StoreBackend`] on top of a `sqlx` connection pool. The tables map
//! one to one onto the records in [`checkpoint`](crate::checkpoint):
//!
//! | table                   | key                                        |
//! |-------------------------|--------------------------------------------|
//! | `threads`               | `id`                                       |
//! | `checkpoints`           | `id`                                       |
//! | `checkpoint_blobs`      | `(thread_id, channel, version)`            |
//! | `checkpoint_writes`     | `(checkpoint_id, task_id, idx, channel)`   |
//! | `checkpoint_migrations` | `version`                                  |
//!
//! Pointer moves are compare-and-swap `UPDATE`s guarded by the expected parent.
//! A commit runs in one transaction whose first statement is that swap, so the
//! write lock is taken before anything is read and a lost race rolls back
//! before any blob or checkpoint row is written.

pub mod schema;

use crate::{
    checkpoint::{
        content_digest, now_micros, Blob, BlobKey, BlobRef, Checkpoint, CheckpointId,
        MigrationRecord, NewBlob, NewWrite, Thread, ThreadId, ThreadStatus, WriteCursor,
        WriteRecord,
    },
    commit::CommitPlan,
    config::StoreConfig,
    error::{Result, StoreError},
    metadata::Document,
    traits::{
        BlobStore, CheckpointStore, Migration, MigrationManager, StoreBackend, ThreadRegistry,
        WriteAheadLog,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Checkpoint store backed by SQLite
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    page_size: usize,
    migration_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    /// Open (or create) the database named by `config.database_url`
    ///
    /// Applies the built-in migrations when `config.auto_migrate` is set.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let in_memory = config.is_in_memory();

        let mut options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout());
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        debug!(url = %config.database_url, "Connecting to checkpoint database");
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            // the database lives exactly as long as its only connection
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self::from_pool(pool, config.pending_page_size).await?;
        if config.auto_migrate {
            let version = store
                .migrate_to_latest(&store.schema_migrations())
                .await?;
            debug!(version, "Schema up to date");
        }

        info!(url = %config.database_url, "Checkpoint database ready");
        Ok(store)
    }

    /// Wrap an existing pool; only the migration bookkeeping table is created
    pub async fn from_pool(pool: SqlitePool, page_size: usize) -> Result<Self> {
        sqlx::query(schema::MIGRATIONS_TABLE).execute(&pool).await?;
        Ok(Self {
            pool,
            page_size: page_size.max(1),
            migration_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Error explaining why a pointer swap to `checkpoint` matched no row
    async fn rejected_advance(&self, checkpoint: &Checkpoint) -> Result<StoreError> {
        let thread = self.get_thread(&checkpoint.thread_id).await?;
        Ok(match thread.check_advance(checkpoint) {
            Err(e) => e,
            Ok(()) => StoreError::InvalidTransition(format!(
                "pointer of thread {} moved during the update",
                checkpoint.thread_id
            )),
        })
    }

    /// Error explaining why an append inserted no row
    async fn rejected_write(&self, write: WriteRecord) -> Result<StoreError> {
        self.get_thread(&write.thread_id).await?;
        if self.find_checkpoint(&write.checkpoint_id).await?.is_some() {
            return Ok(StoreError::CheckpointFinalized(write.checkpoint_id));
        }
        Ok(StoreError::DuplicateWrite {
            checkpoint_id: write.checkpoint_id,
            task_id: write.task_id,
            idx: write.idx,
            channel: write.channel,
        })
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(value)
        .single()
        .ok_or_else(|| StoreError::Corrupted(format!("timestamp out of range: {value}")))
}

fn parse_checkpoint_id(value: &str) -> Result<CheckpointId> {
    Uuid::parse_str(value)
        .map(CheckpointId::from)
        .map_err(|e| StoreError::Corrupted(format!("malformed checkpoint id {value}: {e}")))
}

fn parse_optional_id(value: Option<String>) -> Result<Option<CheckpointId>> {
    value.as_deref().map(parse_checkpoint_id).transpose()
}

fn thread_from_row(row: &SqliteRow) -> Result<Thread> {
    let status: String = row.try_get("status")?;
    Ok(Thread {
        id: ThreadId::from(row.try_get::<String, _>("id")?),
        created_at: from_micros(row.try_get("created_at")?)?,
        status: status.parse()?,
        latest_checkpoint_id: parse_optional_id(row.try_get("latest_checkpoint_id")?)?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint> {
    let id: String = row.try_get("id")?;
    let metadata: String = row.try_get("metadata_json")?;
    let channel_versions: String = row.try_get("channel_versions_json")?;
    Ok(Checkpoint {
        id: parse_checkpoint_id(&id)?,
        thread_id: ThreadId::from(row.try_get::<String, _>("thread_id")?),
        parent_id: parse_optional_id(row.try_get("parent_checkpoint_id")?)?,
        kind: row.try_get("type")?,
        metadata: serde_json::from_str(&metadata)?,
        channel_versions: serde_json::from_str(&channel_versions)?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn write_from_row(row: &SqliteRow) -> Result<WriteRecord> {
    let checkpoint_id: String = row.try_get("checkpoint_id")?;
    Ok(WriteRecord {
        thread_id: ThreadId::from(row.try_get::<String, _>("thread_id")?),
        checkpoint_id: parse_checkpoint_id(&checkpoint_id)?,
        task_id: row.try_get("task_id")?,
        idx: row.try_get("idx")?,
        channel: row.try_get("channel")?,
        kind: row.try_get("type")?,
        payload: row.try_get("content")?,
        written_at: from_micros(row.try_get("written_at")?)?,
    })
}

fn blob_from_row(key: &BlobKey, row: &SqliteRow) -> Result<Blob> {
    let content: Vec<u8> = row.try_get("content")?;
    // rows written before the digest column existed
    let digest = row
        .try_get::<Option<String>, _>("digest")?
        .unwrap_or_else(|| content_digest(&content));
    Ok(Blob {
        reference: BlobRef {
            key: key.clone(),
            version: row.try_get("version")?,
            kind: row.try_get("type")?,
            checkpoint_id: parse_optional_id(row.try_get("checkpoint_id")?)?,
            size: content.len(),
            digest,
        },
        content,
    })
}

async fn fetch_checkpoint(
    conn: &mut SqliteConnection,
    checkpoint_id: &CheckpointId,
) -> Result<Option<Checkpoint>> {
    sqlx::query(
        "SELECT id, thread_id, parent_checkpoint_id, type, metadata_json,
                channel_versions_json, created_at
         FROM checkpoints WHERE id = ?",
    )
    .bind(checkpoint_id.to_string())
    .fetch_optional(&mut *conn)
    .await?
    .as_ref()
    .map(checkpoint_from_row)
    .transpose()
}

async fn insert_checkpoint(conn: &mut SqliteConnection, checkpoint: &Checkpoint) -> Result<()> {
    sqlx::query(
        "INSERT INTO checkpoints (id, thread_id, parent_checkpoint_id, type, metadata_json,
                                  channel_versions_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(checkpoint.id.to_string())
    .bind(checkpoint.thread_id.as_str())
    .bind(checkpoint.parent_id.map(|id| id.to_string()))
    .bind(&checkpoint.kind)
    .bind(serde_json::to_string(&checkpoint.metadata)?)
    .bind(serde_json::to_string(&checkpoint.channel_versions)?)
    .bind(micros(checkpoint.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_blob(
    conn: &mut SqliteConnection,
    key: &BlobKey,
    version: i64,
) -> Result<Option<Blob>> {
    sqlx::query(
        "SELECT version, type, checkpoint_id, digest, content
         FROM checkpoint_blobs WHERE thread_id = ? AND channel = ? AND version = ?",
    )
    .bind(key.thread_id.as_str())
    .bind(&key.channel)
    .bind(version)
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| blob_from_row(key, &row))
    .transpose()
}

async fn latest_blob_version(conn: &mut SqliteConnection, key: &BlobKey) -> Result<Option<i64>> {
    Ok(sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(version) FROM checkpoint_blobs WHERE thread_id = ? AND channel = ?",
    )
    .bind(key.thread_id.as_str())
    .bind(&key.channel)
    .fetch_one(&mut *conn)
    .await?)
}

/// Insert a blob unless a higher version of its key exists
async fn put_blob(conn: &mut SqliteConnection, blob: &NewBlob) -> Result<BlobRef> {
    // rejects non-positive versions
    blob.check_put(None, None)?;

    let inserted = sqlx::query(
        "INSERT INTO checkpoint_blobs
             (thread_id, channel, version, type, checkpoint_id, content, digest)
         SELECT ?, ?, ?, ?, ?, ?, ?
         WHERE NOT EXISTS (
             SELECT 1 FROM checkpoint_blobs
             WHERE thread_id = ? AND channel = ? AND version > ?
         )
         ON CONFLICT (thread_id, channel, version) DO NOTHING",
    )
    .bind(blob.key.thread_id.as_str())
    .bind(&blob.key.channel)
    .bind(blob.version)
    .bind(&blob.kind)
    .bind(blob.checkpoint_id.map(|id| id.to_string()))
    .bind(&blob.content)
    .bind(blob.digest())
    .bind(blob.key.thread_id.as_str())
    .bind(&blob.key.channel)
    .bind(blob.version)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted == 1 {
        return Ok(blob.reference());
    }

    let existing = fetch_blob(&mut *conn, &blob.key, blob.version).await?;
    let latest = latest_blob_version(&mut *conn, &blob.key).await?;
    if blob.check_put(existing.as_ref().map(|b| &b.reference), latest)? {
        Ok(blob.reference())
    } else {
        Err(StoreError::VersionConflict {
            key: blob.key.to_string(),
            version: blob.version,
        })
    }
}

#[async_trait]
impl ThreadRegistry for SqliteStore {
    async fn create_thread(&self) -> Result<ThreadId> {
        let thread = Thread::new(ThreadId::new());
        sqlx::query(
            "INSERT INTO threads (id, created_at, status, latest_checkpoint_id)
             VALUES (?, ?, ?, NULL)",
        )
        .bind(thread.id.as_str())
        .bind(micros(thread.created_at))
        .bind(thread.status.as_str())
        .execute(&self.pool)
        .await?;

        debug!(thread_id = %thread.id, "Thread created");
        Ok(thread.id)
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Thread> {
        sqlx::query(
            "SELECT id, created_at, status, latest_checkpoint_id FROM threads WHERE id = ?",
        )
        .bind(thread_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(thread_from_row)
        .transpose()?
        .ok_or_else(|| StoreError::NotFound(format!("thread {thread_id}")))
    }

    async fn list_threads(&self, status: Option<ThreadStatus>) -> Result<Vec<Thread>> {
        let status = status.map(|s| s.as_str());
        sqlx::query(
            "SELECT id, created_at, status, latest_checkpoint_id FROM threads
             WHERE ? IS NULL OR status = ?
             ORDER BY created_at, id",
        )
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(thread_from_row)
        .collect()
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    async fn advance(&self, thread_id: &ThreadId, checkpoint_id: &CheckpointId) -> Result<()> {
        let thread = self.get_thread(thread_id).await?;
        let checkpoint = self.get_checkpoint(checkpoint_id).await?;
        thread.check_advance(&checkpoint)?;

        let swapped = sqlx::query(
            "UPDATE threads SET latest_checkpoint_id = ?
             WHERE id = ? AND status = 'active' AND latest_checkpoint_id IS ?",
        )
        .bind(checkpoint_id.to_string())
        .bind(thread_id.as_str())
        .bind(checkpoint.parent_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if swapped == 0 {
            return Err(self.rejected_advance(&checkpoint).await?);
        }

        debug!("Pointer advanced");
        Ok(())
    }

    async fn mark_status(&self, thread_id: &ThreadId, status: ThreadStatus) -> Result<()> {
        if status.is_terminal() {
            let updated = sqlx::query(
                "UPDATE threads SET status = ? WHERE id = ? AND status = 'active'",
            )
            .bind(status.as_str())
            .bind(thread_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if updated == 1 {
                info!(thread_id = %thread_id, status = %status, "Thread status changed");
                return Ok(());
            }
        }

        // either a no-op or a move out of a terminal status
        let thread = self.get_thread(thread_id).await?;
        thread.check_status_change(status)?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let found = sqlx::query("UPDATE threads SET latest_checkpoint_id = NULL WHERE id = ?")
            .bind(thread_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if found == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }

        for statement in [
            "DELETE FROM checkpoint_writes WHERE thread_id = ?",
            "DELETE FROM checkpoint_blobs WHERE thread_id = ?",
            "DELETE FROM checkpoints WHERE thread_id = ?",
            "DELETE FROM threads WHERE id = ?",
        ] {
            sqlx::query(statement)
                .bind(thread_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(thread_id = %thread_id, "Thread deleted");
        Ok(())
    }
}

#[async_trait]
impl WriteAheadLog for SqliteStore {
    async fn append_write(&self, write: NewWrite) -> Result<WriteRecord> {
        let record = WriteRecord::from_new(write);
        let checkpoint_id = record.checkpoint_id.to_string();

        let inserted = sqlx::query(
            "INSERT INTO checkpoint_writes
                 (thread_id, checkpoint_id, task_id, idx, channel, type, content, written_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM threads WHERE id = ?)
               AND NOT EXISTS (SELECT 1 FROM checkpoints WHERE id = ?)
             ON CONFLICT (checkpoint_id, task_id, idx, channel) DO NOTHING",
        )
        .bind(record.thread_id.as_str())
        .bind(&checkpoint_id)
        .bind(&record.task_id)
        .bind(record.idx)
        .bind(&record.channel)
        .bind(&record.kind)
        .bind(&record.payload)
        .bind(micros(record.written_at))
        .bind(record.thread_id.as_str())
        .bind(&checkpoint_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(self.rejected_write(record).await?);
        }

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
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match after {
            Some(cursor) => {
                sqlx::query(
                    "SELECT thread_id, checkpoint_id, task_id, idx, channel, type, content,
                            written_at
                     FROM checkpoint_writes
                     WHERE thread_id = ? AND checkpoint_id = ?
                       AND (task_id, idx, channel) > (?, ?, ?)
                     ORDER BY task_id, idx, channel
                     LIMIT ?",
                )
                .bind(thread_id.as_str())
                .bind(checkpoint_id.to_string())
                .bind(&cursor.task_id)
                .bind(cursor.idx)
                .bind(&cursor.channel)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT thread_id, checkpoint_id, task_id, idx, channel, type, content,
                            written_at
                     FROM checkpoint_writes
                     WHERE thread_id = ? AND checkpoint_id = ?
                     ORDER BY task_id, idx, channel
                     LIMIT ?",
                )
                .bind(thread_id.as_str())
                .bind(checkpoint_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(write_from_row).collect()
    }

    async fn purge(&self, checkpoint_id: &CheckpointId) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM checkpoint_writes WHERE checkpoint_id = ?")
            .bind(checkpoint_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(checkpoint_id = %checkpoint_id, removed, "Pending writes purged");
        Ok(removed)
    }

    async fn pending_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointId>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT checkpoint_id FROM checkpoint_writes
             WHERE thread_id = ? ORDER BY checkpoint_id",
        )
        .bind(thread_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|id| parse_checkpoint_id(id))
        .collect()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn create_checkpoint(
        &self,
        thread_id: &ThreadId,
        parent_id: Option<CheckpointId>,
        kind: &str,
        metadata: Document,
    ) -> Result<CheckpointId> {
        let mut tx = self.pool.begin().await?;

        let threads = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM threads WHERE id = ?")
            .bind(thread_id.as_str())
            .fetch_one(&mut *tx)
            .await?;
        if threads == 0 {
            return Err(StoreError::NotFound(format!("thread {thread_id}")));
        }

        let parent = match parent_id {
            Some(parent_id) => {
                let parent = fetch_checkpoint(&mut tx, &parent_id).await?.ok_or_else(|| {
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
            parent.as_ref(),
            kind,
            metadata,
            parent
                .as_ref()
                .map(|p| p.channel_versions.clone())
                .unwrap_or_default(),
        );
        insert_checkpoint(&mut tx, &checkpoint).await?;
        tx.commit().await?;

        debug!(thread_id = %thread_id, checkpoint_id = %checkpoint.id, "Checkpoint created");
        Ok(checkpoint.id)
    }

    async fn find_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Option<Checkpoint>> {
        let mut conn = self.pool.acquire().await?;
        fetch_checkpoint(&mut conn, checkpoint_id).await
    }

    async fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        sqlx::query(
            "SELECT id, thread_id, parent_checkpoint_id, type, metadata_json,
                    channel_versions_json, created_at
             FROM checkpoints WHERE thread_id = ?
             ORDER BY created_at, id",
        )
        .bind(thread_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(checkpoint_from_row)
        .collect()
    }
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn put(&self, blob: NewBlob) -> Result<BlobRef> {
        let mut conn = self.pool.acquire().await?;
        put_blob(&mut conn, &blob).await
    }

    async fn get(&self, key: &BlobKey, version: i64) -> Result<Blob> {
        let mut conn = self.pool.acquire().await?;
        fetch_blob(&mut conn, key, version)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("blob {key} at version {version}")))
    }

    async fn get_latest(&self, key: &BlobKey, max_version: i64) -> Result<Blob> {
        sqlx::query(
            "SELECT version, type, checkpoint_id, digest, content
             FROM checkpoint_blobs
             WHERE thread_id = ? AND channel = ? AND version <= ?
             ORDER BY version DESC
             LIMIT 1",
        )
        .bind(key.thread_id.as_str())
        .bind(&key.channel)
        .bind(max_version)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| blob_from_row(key, &row))
        .transpose()?
        .ok_or_else(|| StoreError::NotFound(format!("blob {key} at version {max_version}")))
    }

    async fn latest_version(&self, key: &BlobKey) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        latest_blob_version(&mut conn, key).await
    }

    async fn list_versions(&self, key: &BlobKey) -> Result<Vec<BlobRef>> {
        sqlx::query(
            "SELECT version, type, checkpoint_id, digest, content
             FROM checkpoint_blobs WHERE thread_id = ? AND channel = ?
             ORDER BY version",
        )
        .bind(key.thread_id.as_str())
        .bind(&key.channel)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| blob_from_row(key, row).map(|blob| blob.reference))
        .collect()
    }
}

#[async_trait]
impl MigrationManager for SqliteStore {
    type Context = SqliteConnection;

    async fn current_version(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(version), 0) FROM checkpoint_migrations",
            )
            .fetch_one(&self.pool)
            .await?,
        )
    }

    async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        sqlx::query(
            "SELECT version, description, applied_at FROM checkpoint_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(MigrationRecord {
                version: row.try_get("version")?,
                description: row.try_get("description")?,
                applied_at: from_micros(row.try_get("applied_at")?)?,
            })
        })
        .collect()
    }

    #[instrument(skip(self, migration), fields(description = %migration.description()))]
    async fn apply(
        &self,
        version: i64,
        migration: &dyn Migration<SqliteConnection>,
    ) -> Result<MigrationRecord> {
        let _guard = self.migration_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(version), 0) FROM checkpoint_migrations",
        )
        .fetch_one(&mut *tx)
        .await?;
        if version <= current {
            return Err(StoreError::AlreadyApplied(version));
        }
        if version != current + 1 {
            return Err(StoreError::OutOfOrder {
                expected: current + 1,
                actual: version,
            });
        }

        migration.up(&mut tx).await?;

        let record = MigrationRecord {
            version,
            description: migration.description().to_string(),
            applied_at: now_micros(),
        };
        let recorded = sqlx::query(
            "INSERT INTO checkpoint_migrations (version, description, applied_at) VALUES (?, ?, ?)",
        )
        .bind(record.version)
        .bind(&record.description)
        .bind(micros(record.applied_at))
        .execute(&mut *tx)
        .await;
        match recorded {
            Ok(_) => {}
            // another process recorded this version first
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::AlreadyApplied(version));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;

        info!(version, "Migration applied");
        Ok(record)
    }
}

#[async_trait]
impl StoreBackend for SqliteStore {
    #[instrument(
        skip(self, plan),
        fields(
            thread_id = %plan.checkpoint.thread_id,
            checkpoint_id = %plan.checkpoint.id,
            blobs = plan.blobs.len()
        )
    )]
    async fn apply_commit(&self, plan: &CommitPlan) -> Result<Checkpoint> {
        let checkpoint = &plan.checkpoint;
        let mut tx = self.pool.begin().await?;

        let swapped = sqlx::query(
            "UPDATE threads SET latest_checkpoint_id = ?
             WHERE id = ? AND status = 'active' AND latest_checkpoint_id IS ?",
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.thread_id.as_str())
        .bind(checkpoint.parent_id.map(|id| id.to_string()))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if swapped == 0 {
            tx.rollback().await?;
            if self.find_checkpoint(&checkpoint.id).await?.is_some() {
                return Err(StoreError::CheckpointFinalized(checkpoint.id));
            }
            return Err(self.rejected_advance(checkpoint).await?);
        }

        if fetch_checkpoint(&mut tx, &checkpoint.id).await?.is_some() {
            tx.rollback().await?;
            return Err(StoreError::CheckpointFinalized(checkpoint.id));
        }

        // the CAS above holds the write lock, so no append can slip in past this read
        let pending: Vec<WriteCursor> = sqlx::query(
            "SELECT task_id, idx, channel FROM checkpoint_writes WHERE checkpoint_id = ?",
        )
        .bind(checkpoint.id.to_string())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| WriteCursor {
            task_id: row.get("task_id"),
            idx: row.get("idx"),
            channel: row.get("channel"),
        })
        .collect();
        if let Err(e) = plan.check_consumed(&pending) {
            tx.rollback().await?;
            return Err(e);
        }

        // dropping the transaction on any error below rolls everything back
        for blob in &plan.blobs {
            put_blob(&mut tx, blob).await?;
        }
        insert_checkpoint(&mut tx, checkpoint).await?;
        let purged = sqlx::query("DELETE FROM checkpoint_writes WHERE checkpoint_id = ?")
            .bind(checkpoint.id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(purged, "Commit applied");
        Ok(checkpoint.clone())
    }

    async fn unpurged_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT w.checkpoint_id
             FROM checkpoint_writes w
             JOIN checkpoints c ON c.id = w.checkpoint_id
             ORDER BY w.checkpoint_id",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|id| parse_checkpoint_id(id))
        .collect()
    }

    fn schema_migrations(&self) -> Vec<Box<dyn Migration<SqliteConnection>>> {
        schema::builtin_migrations()
    }
}
