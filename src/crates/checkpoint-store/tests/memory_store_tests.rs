//! Integration tests for the in-memory backend

mod common;

use checkpoint_store::{
    CheckpointEngine, FnMigration, InMemoryStore, MemorySchema, MigrationManager, StoreError,
};
use serde_json::json;

async fn engine() -> CheckpointEngine<InMemoryStore> {
    let engine = CheckpointEngine::new(InMemoryStore::new());
    assert_eq!(engine.migrate().await.unwrap(), 3);
    engine
}

#[tokio::test]
async fn test_commit_and_stale_parent() {
    common::commit_two_channels_then_reject_stale_parent(&engine().await).await;
}

#[tokio::test]
async fn test_last_write_wins() {
    common::last_write_wins(&engine().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends() {
    common::concurrent_appends_and_duplicates(&engine().await).await;
}

#[tokio::test]
async fn test_late_append_is_not_lost() {
    common::late_append_is_folded_into_the_commit(&engine().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_commits_on_one_thread() {
    common::parallel_commits_on_one_thread(&engine().await).await;
}

#[tokio::test]
async fn test_pending_listing_pages() {
    let engine = CheckpointEngine::new(InMemoryStore::with_page_size(4));
    engine.migrate().await.unwrap();
    common::pending_listing_pages_lazily(&engine).await;
}

#[tokio::test]
async fn test_idempotent_commit() {
    common::idempotent_commit(&engine().await).await;
}

#[tokio::test]
async fn test_chain_order() {
    common::chain_is_ordered_root_first(&engine().await).await;
}

#[tokio::test]
async fn test_terminal_threads() {
    common::terminal_threads_are_frozen(&engine().await).await;
}

#[tokio::test]
async fn test_foreign_parent() {
    common::commit_rejects_foreign_parent(&engine().await).await;
}

#[tokio::test]
async fn test_finalized_checkpoint() {
    common::finalized_checkpoints_reject_writes(&engine().await).await;
}

#[tokio::test]
async fn test_blob_versions() {
    common::blob_versions_only_move_forward(&engine().await).await;
}

#[tokio::test]
async fn test_resume() {
    common::resume_after_restart(&engine().await).await;
}

#[tokio::test]
async fn test_delete_thread() {
    common::delete_thread_removes_everything(&engine().await).await;
}

#[tokio::test]
async fn test_custom_migrations_extend_builtin_schema() {
    let store = InMemoryStore::new();
    let engine = CheckpointEngine::new(store.clone());
    engine.migrate().await.unwrap();

    let retention = FnMigration::new("add thread retention", |schema: &mut MemorySchema| {
        schema.add_column("threads", "retention_days", json!(30))
    });
    assert!(matches!(
        store.apply(6, &retention).await,
        Err(StoreError::OutOfOrder {
            expected: 4,
            actual: 6
        })
    ));
    assert!(matches!(
        store.apply(2, &retention).await,
        Err(StoreError::AlreadyApplied(2))
    ));

    let record = store.apply(4, &retention).await.unwrap();
    assert_eq!(record.version, 4);
    assert_eq!(store.current_version().await.unwrap(), 4);
    assert!(store.schema().await.has_column("threads", "retention_days"));

    // re-running the built-in set skips what is applied
    assert_eq!(engine.migrate().await.unwrap(), 4);
    let descriptions: Vec<String> = store
        .applied()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.description)
        .collect();
    assert_eq!(descriptions.last().map(String::as_str), Some("add thread retention"));
}
