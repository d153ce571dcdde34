//! # checkpoint-store - Durable Checkpoints for Multi-Step Pipelines
//!
//! **Crash-safe state persistence** for long-running computations split into
//! threads of steps. A thread saves its state incrementally, resumes after a
//! failure and can be inspected or replayed deterministically, while the storage
//! layout evolves through ordered migrations.
//!
//! ## Core Concepts
//!
//! ### 1. Components
//!
//! Each component is an async trait in [`traits`]:
//!
//! - [`ThreadRegistry`] - threads, their status and the compare-and-swap pointer
//!   to the latest canonical checkpoint
//! - [`WriteAheadLog`] - pending channel writes of a checkpoint under
//!   construction, streamed lazily in replay order
//! - [`CheckpointStore`] - immutable snapshots linked to their parent
//! - [`BlobStore`] - versioned, content-addressed channel payloads
//! - [`MigrationManager`] - ordered, append-only schema versions
//!
//! [`StoreBackend`] unites them and adds the atomic commit primitive.
//!
//! ### 2. Commit Protocol
//!
//! [`CheckpointEngine`] runs the protocol on any backend:
//!
//! 1. [`begin`](CheckpointEngine::begin) allocates a building checkpoint on top
//!    of the current pointer
//! 2. tasks [`append`](CheckpointEngine::append) channel writes to it, keyed by
//!    `(task, index, channel)`
//! 3. [`commit`](CheckpointEngine::commit) keeps the last write per channel,
//!    stores one new blob version per written channel, persists the checkpoint,
//!    purges the writes and advances the pointer, all or nothing
//!
//! A commit that lost the pointer race fails with
//! [`StoreError::InvalidTransition`] and can be rebased
//! ([`commit_with_retry`](CheckpointEngine::commit_with_retry)). Re-committing a
//! finalized checkpoint is a no-op that completes any interrupted purge.
//!
//! ### 3. Backends
//!
//! - [`InMemoryStore`] - tests and development
//! - [`SqliteStore`] - durable storage through `sqlx`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use checkpoint_store::{
//!     CheckpointEngine, CommitRequest, JsonSerializer, SqliteStore, StoreConfig, TypedMetadata,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::default().with_database_url("sqlite://pipeline.db");
//!     let store = SqliteStore::connect(&config).await?;
//!     let engine = CheckpointEngine::with_config(store, &config);
//!
//!     let thread_id = engine.start_thread().await?;
//!     let pending = engine.begin(&thread_id).await?;
//!     engine
//!         .append_value(&pending, "preprocess", 0, "volume", &JsonSerializer, &"out/brain.nii.gz")
//!         .await?;
//!
//!     let metadata = TypedMetadata::Preprocess {
//!         selected_output: "out/brain.nii.gz".into(),
//!         candidates: vec![],
//!     };
//!     let checkpoint = engine.commit(CommitRequest::typed(&pending, &metadata)).await?;
//!     println!("committed {}", checkpoint.id);
//!
//!     // after a restart
//!     let resume = engine.resume(&thread_id).await?;
//!     println!("{} checkpoint(s) in flight", resume.in_flight.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`checkpoint`] - records and identifiers
//! - [`metadata`] - [`Document`] and [`TypedMetadata`]
//! - [`traits`] - component seams
//! - [`commit`] - pure commit planning
//! - [`engine`] - [`CheckpointEngine`]
//! - [`memory`], [`sqlite`] - backends
//! - [`config`], [`retry`], [`serializer`], [`error`] - supporting pieces

pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod retry;
pub mod serializer;
pub mod sqlite;
pub mod traits;

// Re-export main types
pub use checkpoint::{
    content_digest, Blob, BlobKey, BlobRef, ChannelVersions, Checkpoint, CheckpointId,
    MigrationRecord, NewBlob, NewWrite, Thread, ThreadId, ThreadStatus, WriteCursor, WriteRecord,
};
pub use commit::{last_writes, plan_commit, CommitPlan, CommitRequest, PendingCheckpoint};
pub use config::{StoreConfig, StoreConfigOverrides};
pub use engine::{
    CheckpointEngine, InFlightCheckpoint, RecoveryConflict, RecoveryReport, ResumePoint,
    StateSnapshot,
};
pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, MemorySchema};
pub use metadata::{Document, TypedMetadata};
pub use retry::RetryPolicy;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use sqlite::{schema::SqlMigration, SqliteStore};
pub use traits::{
    BlobStore, CheckpointStore, FnMigration, Migration, MigrationManager, StoreBackend,
    ThreadRegistry, WriteAheadLog, WriteStream,
};
