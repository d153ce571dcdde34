//! Scenarios shared by the backend integration tests
//!
//! Every function takes a freshly migrated engine and panics on the first
//! violated expectation, so each backend test file only has to provide the
//! store.

#![allow(dead_code)]

use checkpoint_store::{
    plan_commit, BlobKey, BlobStore, ChannelVersions, CheckpointEngine, CheckpointStore,
    CommitRequest, Document, JsonSerializer, NewBlob, RetryPolicy, StoreBackend, StoreError,
    ThreadRegistry, ThreadStatus, TypedMetadata, WriteAheadLog, WriteRecord,
};
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

pub async fn commit_two_channels_then_reject_stale_parent<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
) {
    let thread_id = engine.start_thread().await.unwrap();

    let first = engine.begin(&thread_id).await.unwrap();
    engine
        .append(&first, "ingest", 0, "volume", "path", b"raw/t1.dcm".to_vec())
        .await
        .unwrap();
    engine
        .append(&first, "ingest", 1, "subject", "text", b"sub-01".to_vec())
        .await
        .unwrap();
    let c1 = engine
        .commit(CommitRequest::new(&first, "input", Document::new()))
        .await
        .unwrap();
    assert_eq!(c1.parent_id, None);
    assert_eq!(c1.channel_versions["volume"], 1);
    assert_eq!(c1.channel_versions["subject"], 1);

    let second = engine.begin(&thread_id).await.unwrap();
    let racer = engine.begin(&thread_id).await.unwrap();
    engine
        .append(&second, "convert", 0, "volume", "path", b"nifti/t1.nii.gz".to_vec())
        .await
        .unwrap();
    engine
        .append(&racer, "convert", 0, "volume", "path", b"nifti/other.nii.gz".to_vec())
        .await
        .unwrap();
    let c2 = engine
        .commit(CommitRequest::new(&second, "loop", Document::new()))
        .await
        .unwrap();
    assert_eq!(c2.parent_id, Some(c1.id));
    assert_eq!(c2.channel_versions["volume"], 2);
    assert_eq!(c2.channel_versions["subject"], 1);

    // the pointer moved after the racer was begun
    assert!(matches!(
        engine
            .commit(CommitRequest::new(&racer, "loop", Document::new()))
            .await,
        Err(StoreError::InvalidTransition(_))
    ));
    assert_eq!(
        engine.store().pending_checkpoints(&thread_id).await.unwrap(),
        vec![racer.checkpoint_id]
    );
    assert_eq!(
        ThreadRegistry::get_latest(engine.store(), &thread_id)
            .await
            .unwrap(),
        Some(c2.id)
    );
    assert_eq!(engine.store().list_checkpoints(&thread_id).await.unwrap().len(), 2);

    let state = engine.get_state(&thread_id).await.unwrap().unwrap();
    assert_eq!(state.checkpoint.id, c2.id);
    assert_eq!(state.channels["volume"].content, b"nifti/t1.nii.gz");
    assert_eq!(state.channels["subject"].content, b"sub-01");
}

pub async fn last_write_wins<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();

    for (task, idx, payload) in [
        ("seg-a", 0, "first"),
        ("seg-a", 2, "highest index"),
        ("seg-b", 1, "middle"),
        ("seg-a", 3, "tie, lower task"),
        ("seg-b", 3, "tie, greater task"),
    ] {
        engine
            .append(&pending, task, idx, "mask", "text", payload.as_bytes().to_vec())
            .await
            .unwrap();
    }
    engine
        .append(&pending, "seg-a", 0, "log", "text", b"only".to_vec())
        .await
        .unwrap();

    let checkpoint = engine
        .commit(CommitRequest::new(&pending, "loop", Document::new()))
        .await
        .unwrap();
    assert_eq!(checkpoint.channel_versions.len(), 2);

    let mask = BlobStore::get(engine.store(), &BlobKey::new(thread_id.clone(), "mask"), 1)
        .await
        .unwrap();
    assert_eq!(mask.content, b"tie, greater task");
    assert_eq!(mask.reference.checkpoint_id, Some(checkpoint.id));
    assert_eq!(
        engine
            .store()
            .list_versions(&BlobKey::new(thread_id, "mask"))
            .await
            .unwrap()
            .len(),
        1
    );
}

pub async fn concurrent_appends_and_duplicates<S: StoreBackend + 'static>(
    engine: &CheckpointEngine<S>,
) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();

    let mut handles = Vec::new();
    for task in 0..4 {
        let engine = engine.clone();
        let pending = pending.clone();
        handles.push(tokio::spawn(async move {
            for idx in 0..10 {
                engine
                    .append(
                        &pending,
                        format!("task-{task}"),
                        idx,
                        format!("channel-{}", idx % 3),
                        "bytes",
                        vec![task as u8, idx as u8],
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let writes: Vec<WriteRecord> = engine
        .store()
        .list_pending(&thread_id, &pending.checkpoint_id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(writes.len(), 40);
    let keys: Vec<_> = writes.iter().map(|w| (w.task_id.clone(), w.idx)).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    assert!(matches!(
        engine
            .append(&pending, "task-0", 0, "channel-0", "bytes", vec![9])
            .await,
        Err(StoreError::DuplicateWrite { idx: 0, .. })
    ));

    let checkpoint = engine
        .commit(CommitRequest::new(&pending, "loop", Document::new()))
        .await
        .unwrap();
    assert_eq!(checkpoint.channel_versions.len(), 3);
    // idx 9 lands on channel-0; task-3 is the greatest task id
    let state = engine.get_state(&thread_id).await.unwrap().unwrap();
    assert_eq!(state.channels["channel-0"].content, vec![3, 9]);
    assert!(engine
        .store()
        .pending_checkpoints(&thread_id)
        .await
        .unwrap()
        .is_empty());
}

pub async fn pending_listing_pages_lazily<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();
    for idx in (0..25).rev() {
        engine
            .append(&pending, "render", idx, "frame", "bytes", vec![idx as u8])
            .await
            .unwrap();
    }

    let all: Vec<WriteRecord> = engine
        .store()
        .list_pending(&thread_id, &pending.checkpoint_id)
        .try_collect()
        .await
        .unwrap();
    let indexes: Vec<i64> = all.iter().map(|w| w.idx).collect();
    assert_eq!(indexes, (0..25).collect::<Vec<_>>());

    // resuming after the tenth write yields the rest
    let rest: Vec<WriteRecord> = engine
        .store()
        .list_pending_from(&thread_id, &pending.checkpoint_id, Some(all[9].cursor()))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rest.len(), 15);
    assert_eq!(rest[0].idx, 10);
}

pub async fn idempotent_commit<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();
    engine
        .append_value(&pending, "qc", 0, "report", &JsonSerializer, &json!({"snr": 21.5}))
        .await
        .unwrap();

    let request = CommitRequest::new(
        &pending,
        "loop",
        Document::new().with("step", json!("qc")),
    );
    let first = engine.commit(request.clone()).await.unwrap();
    let again = engine.commit(request).await.unwrap();
    assert_eq!(first, again);

    let key = BlobKey::new(thread_id.clone(), "report");
    assert_eq!(engine.store().list_versions(&key).await.unwrap().len(), 1);
    assert_eq!(engine.store().list_checkpoints(&thread_id).await.unwrap().len(), 1);
    assert_eq!(engine.history(&thread_id).await.unwrap(), vec![first]);
}

pub async fn chain_is_ordered_root_first<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let mut committed = Vec::new();
    for step in 0..5 {
        let pending = engine.begin(&thread_id).await.unwrap();
        engine
            .append(&pending, "step", 0, "counter", "text", step.to_string().into_bytes())
            .await
            .unwrap();
        committed.push(
            engine
                .commit(CommitRequest::new(&pending, "loop", Document::new()))
                .await
                .unwrap(),
        );
    }

    let last = committed.last().unwrap().id;
    let chain = engine.store().list_chain(&thread_id, &last).await.unwrap();
    assert_eq!(chain, committed);
    assert!(chain[0].is_root());
    for pair in chain.windows(2) {
        assert_eq!(pair[1].parent_id, Some(pair[0].id));
        assert!(pair[1].created_at > pair[0].created_at);
    }
    assert_eq!(chain[4].channel_versions["counter"], 5);

    // older states stay readable
    let third = engine.state_at(&chain[2].id).await.unwrap();
    assert_eq!(third.channels["counter"].content, b"2");

    let other = engine.start_thread().await.unwrap();
    assert!(matches!(
        engine.store().list_chain(&other, &last).await,
        Err(StoreError::NotFound(_))
    ));
}

pub async fn terminal_threads_are_frozen<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();
    let c1 = engine
        .commit(CommitRequest::new(&pending, "input", Document::new()))
        .await
        .unwrap();

    let late = engine.begin(&thread_id).await.unwrap();
    let branch = engine
        .store()
        .create_checkpoint(&thread_id, Some(c1.id), "loop", Document::new())
        .await
        .unwrap();

    engine
        .mark_status(&thread_id, ThreadStatus::Failed)
        .await
        .unwrap();
    // repeating a terminal status is a no-op
    engine
        .mark_status(&thread_id, ThreadStatus::Failed)
        .await
        .unwrap();
    assert!(matches!(
        engine.mark_status(&thread_id, ThreadStatus::Active).await,
        Err(StoreError::InvalidTransition(_))
    ));

    assert!(matches!(
        engine.store().advance(&thread_id, &branch).await,
        Err(StoreError::ThreadTerminated { .. })
    ));
    assert!(matches!(
        engine
            .commit(CommitRequest::new(&late, "loop", Document::new()))
            .await,
        Err(StoreError::ThreadTerminated { .. })
    ));
    assert!(matches!(
        engine.begin(&thread_id).await,
        Err(StoreError::ThreadTerminated { .. })
    ));

    let thread = engine.store().get_thread(&thread_id).await.unwrap();
    assert_eq!(thread.status, ThreadStatus::Failed);
    assert_eq!(thread.latest_checkpoint_id, Some(c1.id));

    let failed = engine
        .store()
        .list_threads(Some(ThreadStatus::Failed))
        .await
        .unwrap();
    assert!(failed.iter().any(|t| t.id == thread_id));
    assert!(engine
        .store()
        .list_threads(Some(ThreadStatus::Active))
        .await
        .unwrap()
        .iter()
        .all(|t| t.id != thread_id));
}

pub async fn commit_rejects_foreign_parent<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let a = engine.start_thread().await.unwrap();
    let b = engine.start_thread().await.unwrap();

    let pending_a = engine.begin(&a).await.unwrap();
    let in_a = engine
        .commit(CommitRequest::new(&pending_a, "input", Document::new()))
        .await
        .unwrap();

    let pending_b = engine.begin(&b).await.unwrap();
    let request = CommitRequest::new(&pending_b, "input", Document::new()).rebase(Some(in_a.id));
    assert!(matches!(
        engine.commit(request).await,
        Err(StoreError::InvalidParent(_))
    ));
    assert!(matches!(
        engine
            .store()
            .create_checkpoint(&b, Some(in_a.id), "loop", Document::new())
            .await,
        Err(StoreError::InvalidParent(_))
    ));
    assert!(engine.store().list_checkpoints(&b).await.unwrap().is_empty());
}

pub async fn finalized_checkpoints_reject_writes<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();
    engine
        .append(&pending, "t", 0, "a", "bytes", b"x".to_vec())
        .await
        .unwrap();
    let committed = engine
        .commit(CommitRequest::new(&pending, "loop", Document::new()))
        .await
        .unwrap();

    assert!(matches!(
        engine.append(&pending, "t", 1, "a", "bytes", b"y".to_vec()).await,
        Err(StoreError::CheckpointFinalized(id)) if id == committed.id
    ));
    assert!(matches!(
        engine.store().get_thread(&"no-such-thread".into()).await,
        Err(StoreError::NotFound(_))
    ));
}

pub async fn blob_versions_only_move_forward<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let key = BlobKey::new(thread_id.clone(), "atlas");
    let blob = |version: i64, content: &[u8]| NewBlob {
        key: key.clone(),
        version,
        kind: "bytes".into(),
        checkpoint_id: None,
        content: content.to_vec(),
    };

    let v1 = engine.store().put(blob(1, b"one")).await.unwrap();
    assert_eq!(engine.store().put(blob(1, b"one")).await.unwrap(), v1);
    assert!(matches!(
        engine.store().put(blob(1, b"uno")).await,
        Err(StoreError::VersionConflict { version: 1, .. })
    ));
    engine.store().put(blob(3, b"three")).await.unwrap();
    assert!(matches!(
        engine.store().put(blob(2, b"two")).await,
        Err(StoreError::VersionConflict { version: 2, .. })
    ));

    let visible = BlobStore::get_latest(engine.store(), &key, 2).await.unwrap();
    assert_eq!(visible.reference.version, 1);
    assert_eq!(visible.reference.digest, checkpoint_store::content_digest(b"one"));
    assert!(matches!(
        BlobStore::get_latest(engine.store(), &key, 0).await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(engine.store().latest_version(&key).await.unwrap(), Some(3));
}

pub async fn resume_after_restart<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let thread_id = engine.start_thread().await.unwrap();
    let first = engine.begin(&thread_id).await.unwrap();
    engine
        .append_value(&first, "convert", 0, "volume", &JsonSerializer, &"nifti/t1.nii.gz")
        .await
        .unwrap();
    let metadata = TypedMetadata::ImageConversion {
        source: "raw/t1.dcm".into(),
        output: "nifti/t1.nii.gz".into(),
    };
    engine
        .commit(CommitRequest::typed(&first, &metadata))
        .await
        .unwrap();

    let second = engine.begin(&thread_id).await.unwrap();
    engine
        .append_value(&second, "seg", 0, "artifacts", &JsonSerializer, &vec!["aseg.mgz"])
        .await
        .unwrap();

    let resume = engine.resume(&thread_id).await.unwrap();
    let latest = resume.latest.unwrap();
    assert_eq!(latest.checkpoint.typed_metadata(), metadata);
    let volume: String = latest.value("volume", &JsonSerializer).unwrap().unwrap();
    assert_eq!(volume, "nifti/t1.nii.gz");

    assert_eq!(resume.in_flight.len(), 1);
    assert_eq!(resume.in_flight[0].pending, second);
    assert_eq!(resume.in_flight[0].writes.len(), 1);
}

pub async fn delete_thread_removes_everything<S: StoreBackend>(engine: &CheckpointEngine<S>) {
    let doomed = engine.start_thread().await.unwrap();
    let kept = engine.start_thread().await.unwrap();

    for thread_id in [&doomed, &kept] {
        let pending = engine.begin(thread_id).await.unwrap();
        engine
            .append(&pending, "t", 0, "a", "bytes", b"x".to_vec())
            .await
            .unwrap();
        engine
            .commit(CommitRequest::new(&pending, "loop", Document::new()))
            .await
            .unwrap();
        let open = engine.begin(thread_id).await.unwrap();
        engine
            .append(&open, "t", 0, "a", "bytes", b"y".to_vec())
            .await
            .unwrap();
    }

    engine.delete_thread(&doomed).await.unwrap();

    assert!(matches!(
        engine.store().get_thread(&doomed).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(engine.store().list_checkpoints(&doomed).await.unwrap().is_empty());
    assert!(engine
        .store()
        .list_versions(&BlobKey::new(doomed.clone(), "a"))
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .store()
        .pending_checkpoints(&doomed)
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        engine.delete_thread(&doomed).await,
        Err(StoreError::NotFound(_))
    ));

    assert_eq!(engine.history(&kept).await.unwrap().len(), 1);
    assert_eq!(engine.store().pending_checkpoints(&kept).await.unwrap().len(), 1);
}

/// A write appended after the commit was planned must not be purged unseen
pub async fn late_append_is_folded_into_the_commit<S: StoreBackend>(
    engine: &CheckpointEngine<S>,
) {
    let thread_id = engine.start_thread().await.unwrap();
    let pending = engine.begin(&thread_id).await.unwrap();
    engine
        .append(&pending, "convert", 0, "vol", "path", b"nifti/t1.nii.gz".to_vec())
        .await
        .unwrap();

    let request = CommitRequest::new(&pending, "loop", Document::new());
    let planned: Vec<WriteRecord> = engine
        .store()
        .list_pending(&thread_id, &pending.checkpoint_id)
        .try_collect()
        .await
        .unwrap();
    let plan = plan_commit(&request, None, &planned, &ChannelVersions::new());

    // lands between planning and applying
    engine
        .append(&pending, "seg", 0, "seg", "path", b"aseg.mgz".to_vec())
        .await
        .unwrap();

    assert!(matches!(
        engine.store().apply_commit(&plan).await,
        Err(StoreError::PendingWritesChanged(id)) if id == pending.checkpoint_id
    ));
    assert!(engine
        .store()
        .find_checkpoint(&pending.checkpoint_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        ThreadRegistry::get_latest(engine.store(), &thread_id)
            .await
            .unwrap(),
        None
    );
    let still_pending: Vec<WriteRecord> = engine
        .store()
        .list_pending(&thread_id, &pending.checkpoint_id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(still_pending.len(), 2);

    let checkpoint = engine.commit(request).await.unwrap();
    let channels: Vec<&str> = checkpoint.channel_versions.keys().map(String::as_str).collect();
    assert_eq!(channels, vec!["seg", "vol"]);
    assert!(engine
        .store()
        .pending_checkpoints(&thread_id)
        .await
        .unwrap()
        .is_empty());

    let state = engine.get_state(&thread_id).await.unwrap().unwrap();
    assert_eq!(state.channels["seg"].content, b"aseg.mgz");
}

/// Parallel commits on one thread: one wins the pointer, retries form a line
pub async fn parallel_commits_on_one_thread<S: StoreBackend + 'static>(
    engine: &CheckpointEngine<S>,
) {
    const WRITERS: usize = 6;

    let thread_id = engine.start_thread().await.unwrap();
    let mut begun = Vec::with_capacity(WRITERS);
    for writer in 0..WRITERS {
        let pending = engine.begin(&thread_id).await.unwrap();
        engine
            .append(
                &pending,
                format!("writer-{writer}"),
                0,
                "mask",
                "text",
                format!("mask from writer {writer}").into_bytes(),
            )
            .await
            .unwrap();
        begun.push(pending);
    }

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = begun
        .iter()
        .cloned()
        .map(|pending| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let outcome = engine
                    .commit(CommitRequest::new(&pending, "loop", Document::new()))
                    .await;
                (pending, outcome)
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            (_, Ok(checkpoint)) => winners.push(checkpoint),
            (pending, Err(StoreError::InvalidTransition(_))) => losers.push(pending),
            (_, Err(other)) => panic!("unexpected commit error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), WRITERS - 1);
    assert_eq!(winners[0].parent_id, None);
    assert_eq!(
        ThreadRegistry::get_latest(engine.store(), &thread_id)
            .await
            .unwrap(),
        Some(winners[0].id)
    );

    // every loser can fail at most once per other loser that lands first
    let retrying = engine.clone().with_retry_policy(
        RetryPolicy::new(WRITERS as u32 + 2).with_initial_interval(Duration::from_millis(1)),
    );
    let barrier = Arc::new(Barrier::new(losers.len()));
    let handles: Vec<_> = losers
        .into_iter()
        .map(|pending| {
            let engine = retrying.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                engine
                    .commit_with_retry(CommitRequest::new(&pending, "loop", Document::new()))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let chain = engine.history(&thread_id).await.unwrap();
    assert_eq!(chain.len(), WRITERS);
    assert_eq!(chain[0].id, winners[0].id);
    for pair in chain.windows(2) {
        assert_eq!(pair[1].parent_id, Some(pair[0].id));
    }
    assert_eq!(
        engine.store().list_checkpoints(&thread_id).await.unwrap().len(),
        WRITERS
    );
    assert_eq!(chain.last().unwrap().channel_versions["mask"], WRITERS as i64);
    assert!(engine
        .store()
        .pending_checkpoints(&thread_id)
        .await
        .unwrap()
        .is_empty());
}
