//! Subcommand handlers
//!
//! Every handler returns the JSON document printed by `ckpt`. Payload bytes are
//! summarized (size, digest) and only decoded when their type tag says JSON.

use anyhow::{Context, Result};
use checkpoint_store::{
    serializer, Blob, CheckpointEngine, CheckpointId, MigrationManager, StoreBackend, ThreadId,
    ThreadRegistry, ThreadStatus, WriteRecord,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Apply the built-in migrations
pub async fn migrate<S: StoreBackend>(engine: &CheckpointEngine<S>) -> Result<Value> {
    let version = engine.migrate().await.context("Migration failed")?;
    Ok(json!({ "version": version }))
}

/// Schema version, migration history and thread counts
pub async fn status<S: StoreBackend>(engine: &CheckpointEngine<S>) -> Result<Value> {
    let store = engine.store();
    let version = store.current_version().await?;
    let migrations = store.applied().await?;

    let mut threads: BTreeMap<&str, usize> = BTreeMap::new();
    for thread in store.list_threads(None).await? {
        *threads.entry(thread.status.as_str()).or_default() += 1;
    }

    Ok(json!({
        "version": version,
        "migrations": migrations,
        "threads": threads,
    }))
}

pub async fn threads<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
    status: Option<ThreadStatus>,
) -> Result<Value> {
    let threads = engine.store().list_threads(status).await?;
    Ok(serde_json::to_value(threads)?)
}

/// One checkpoint with its decoded metadata and the blobs it references
pub async fn show<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
    checkpoint_id: &CheckpointId,
) -> Result<Value> {
    let state = engine
        .state_at(checkpoint_id)
        .await
        .with_context(|| format!("Failed to load checkpoint {checkpoint_id}"))?;
    let (_, typed) = state.checkpoint.typed_metadata().encode();

    Ok(json!({
        "checkpoint": state.checkpoint,
        "typed_metadata": typed,
        "blobs": state
            .channels
            .values()
            .map(|blob| &blob.reference)
            .collect::<Vec<_>>(),
    }))
}

/// Canonical chain of a thread, root first
pub async fn chain<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
    thread_id: &ThreadId,
) -> Result<Value> {
    let history = engine
        .history(thread_id)
        .await
        .with_context(|| format!("Failed to walk thread {thread_id}"))?;
    Ok(serde_json::to_value(history)?)
}

/// Building checkpoints of a thread and their pending writes
pub async fn pending<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
    thread_id: &ThreadId,
) -> Result<Value> {
    let resume = engine
        .resume(thread_id)
        .await
        .with_context(|| format!("Failed to read pending writes of thread {thread_id}"))?;

    let in_flight: Vec<Value> = resume
        .in_flight
        .iter()
        .map(|checkpoint| {
            let winners: BTreeMap<&str, Value> = checkpoint
                .projection()
                .into_iter()
                .map(|(channel, write)| {
                    (channel, json!({ "task_id": write.task_id, "idx": write.idx }))
                })
                .collect();
            json!({
                "checkpoint_id": checkpoint.pending.checkpoint_id,
                "parent": checkpoint.pending.parent,
                "writes": checkpoint.writes.iter().map(write_summary).collect::<Vec<_>>(),
                "winners": winners,
            })
        })
        .collect();

    Ok(json!({
        "thread_id": thread_id,
        "latest_checkpoint_id": resume.thread.latest_checkpoint_id,
        "in_flight": in_flight,
    }))
}

/// Channel values at the latest canonical checkpoint
pub async fn state<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
    thread_id: &ThreadId,
) -> Result<Value> {
    let Some(state) = engine
        .get_state(thread_id)
        .await
        .with_context(|| format!("Failed to load state of thread {thread_id}"))?
    else {
        return Ok(json!({ "thread_id": thread_id, "checkpoint": null, "channels": {} }));
    };

    let channels: BTreeMap<&str, Value> = state
        .channels
        .iter()
        .map(|(channel, blob)| (channel.as_str(), blob_summary(blob)))
        .collect();
    Ok(json!({
        "thread_id": thread_id,
        "checkpoint": state.checkpoint,
        "channels": channels,
    }))
}

/// Finish commits interrupted before their pending writes were purged
pub async fn recover<S: StoreBackend>(engine: &CheckpointEngine<S>) -> Result<Value> {
    let report = engine.recover().await.context("Recovery failed")?;
    Ok(serde_json::to_value(report)?)
}

pub async fn delete_thread<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
    thread_id: &ThreadId,
) -> Result<Value> {
    engine
        .delete_thread(thread_id)
        .await
        .with_context(|| format!("Failed to delete thread {thread_id}"))?;
    Ok(json!({ "deleted": thread_id }))
}

fn write_summary(write: &WriteRecord) -> Value {
    json!({
        "task_id": write.task_id,
        "idx": write.idx,
        "channel": write.channel,
        "type": write.kind,
        "size": write.payload.len(),
        "written_at": write.written_at,
    })
}

fn blob_summary(blob: &Blob) -> Value {
    let mut summary = json!({
        "version": blob.reference.version,
        "type": blob.reference.kind,
        "size": blob.reference.size,
        "digest": blob.reference.digest,
    });
    if let Some(value) = serializer::preview(&blob.reference.kind, &blob.content) {
        summary["value"] = value;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_store::{CommitRequest, Document, InMemoryStore, JsonSerializer};

    async fn engine() -> CheckpointEngine<InMemoryStore> {
        let engine = CheckpointEngine::new(InMemoryStore::new());
        engine.migrate().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_state_decodes_json_channels() {
        let engine = engine().await;
        let thread_id = engine.start_thread().await.unwrap();
        let pending = engine.begin(&thread_id).await.unwrap();
        engine
            .append_value(&pending, "qc", 0, "report", &JsonSerializer, &json!({"snr": 20}))
            .await
            .unwrap();
        engine
            .append(&pending, "qc", 1, "thumbnail", "png", vec![0x89, 0x50])
            .await
            .unwrap();
        engine
            .commit(CommitRequest::new(&pending, "render", Document::new()))
            .await
            .unwrap();

        let view = state(&engine, &thread_id).await.unwrap();
        assert_eq!(view["channels"]["report"]["value"]["snr"], 20);
        assert_eq!(view["channels"]["thumbnail"]["size"], 2);
        assert!(view["channels"]["thumbnail"].get("value").is_none());
    }

    #[tokio::test]
    async fn test_state_before_first_commit() {
        let engine = engine().await;
        let thread_id = engine.start_thread().await.unwrap();
        let view = state(&engine, &thread_id).await.unwrap();
        assert!(view["checkpoint"].is_null());
    }

    #[tokio::test]
    async fn test_pending_lists_winners() {
        let engine = engine().await;
        let thread_id = engine.start_thread().await.unwrap();
        let pending_checkpoint = engine.begin(&thread_id).await.unwrap();
        for idx in 0..3 {
            engine
                .append(&pending_checkpoint, "seg", idx, "mask", "bytes", vec![idx as u8])
                .await
                .unwrap();
        }

        let view = pending(&engine, &thread_id).await.unwrap();
        let in_flight = &view["in_flight"][0];
        assert_eq!(in_flight["writes"].as_array().unwrap().len(), 3);
        assert_eq!(in_flight["winners"]["mask"]["idx"], 2);
    }

    #[tokio::test]
    async fn test_status_counts_threads() {
        let engine = engine().await;
        let done = engine.start_thread().await.unwrap();
        engine.start_thread().await.unwrap();
        engine
            .mark_status(&done, ThreadStatus::Completed)
            .await
            .unwrap();

        let view = status(&engine).await.unwrap();
        assert_eq!(view["version"], 3);
        assert_eq!(view["threads"]["active"], 1);
        assert_eq!(view["threads"]["completed"], 1);
        assert_eq!(view["migrations"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_unknown_thread_fails() {
        let engine = engine().await;
        let err = delete_thread(&engine, &ThreadId::from("nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to delete thread nope"));
    }
}
