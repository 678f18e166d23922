use cp_common::{CanonicalId, Collection, OwnerScope};
use cp_sync::{
    LocalCache, MemoryRemoteStore, RemoteOp, Snapshot, SyncConfig, SyncCoordinator, Topic,
    WriteOutcome,
};
use cp_test_helpers::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (SyncCoordinator<MemoryRemoteStore>, Arc<MemoryRemoteStore>) {
    suppress_logs();
    let remote = Arc::new(MemoryRemoteStore::new());
    let sync = SyncCoordinator::new(SyncConfig::default(), Arc::clone(&remote), LocalCache::in_memory())
        .expect("default config is valid");
    (sync, remote)
}

fn class_a() -> OwnerScope {
    scope("teacher-1", "class-a")
}

#[tokio::test]
async fn test_ack_then_echo_leaves_one_record() {
    let (sync, _remote) = setup();
    sync.start_sync(class_a()).await.unwrap();

    let receipt = sync.award_praise("s1", "kind", 1, None).await.unwrap();
    let WriteOutcome::Confirmed(id) = receipt.outcome else {
        panic!("write should be confirmed online");
    };

    // let the echo go through the subscription
    tokio::time::sleep(Duration::from_millis(50)).await;

    let log = sync.praise_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].local_id, receipt.local_id);
    assert_eq!(log[0].canonical_id, Some(id));
}

#[tokio::test]
async fn test_echo_before_ack_is_absorbed_by_pending_record() {
    let (sync, remote) = setup();
    sync.start_sync(class_a()).await.unwrap();
    remote.hold_acks();

    let writer = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.award_praise("s1", "kind", 1, None).await })
    };

    // the echo arrives while the write is still unacknowledged
    assert!(eventually(|| sync.praise_log().iter().any(|r| r.canonical_id.is_some())).await);
    let log = sync.praise_log();
    assert_eq!(log.len(), 1);
    let local_id = log[0].local_id.clone();
    let adopted = log[0].canonical_id.clone();

    remote.release_acks();
    let receipt = writer.await.unwrap().unwrap();

    assert_eq!(receipt.local_id, local_id);
    assert_eq!(receipt.outcome, WriteOutcome::Confirmed(adopted.clone().unwrap()));
    let log = sync.praise_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].canonical_id, adopted);
}

#[tokio::test]
async fn test_late_echo_is_folded_by_ack() {
    let (sync, _remote) = setup();
    let scope = class_a();
    sync.start_sync(scope.clone()).await.unwrap();

    let record = sync.stage(praise("s1", "kind")).unwrap();

    // the echo carries a timestamp far outside the dedup window and is
    // inserted as a separate record
    let echo = remote_document(&scope, "doc-000001", record.created_at - 60_000, praise("s1", "kind"));
    sync.apply_snapshot(Collection::PraiseLog, &Snapshot::new(vec![echo]));
    assert_eq!(sync.praise_log().len(), 2);

    let outcome = sync.push(&record).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Confirmed(CanonicalId::new("doc-000001")));

    let log = sync.praise_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].local_id, record.local_id);
    assert_unique_canonical_ids(&log);
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let (sync, remote) = setup();
    let scope = class_a();
    sync.start_sync(scope.clone()).await.unwrap();
    sync.award_praise("s1", "kind", 1, None).await.unwrap();
    sync.award_praise("s2", "brave", 2, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let before = sync.praise_log();
    let mut changes = sync.subscribe(Topic::Collection(Collection::PraiseLog));

    let path = scope.remote_path(Collection::PraiseLog);
    remote.redeliver(&path);
    remote.redeliver(&path);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sync.praise_log(), before);
    assert!(changes.drain().is_empty(), "unchanged merges must not notify");
}

#[tokio::test]
async fn test_ack_after_match_with_other_device_keeps_both_writes() {
    let (sync, remote) = setup();
    let scope = class_a();
    let path = scope.remote_path(Collection::PraiseLog);
    sync.start_sync(scope.clone()).await.unwrap();

    let record = sync.stage(praise("s1", "kind")).unwrap();
    let other = CanonicalId::new("OTHER");
    remote.seed(
        &path,
        remote_document(&scope, "OTHER", record.created_at + 1_000, praise("s1", "kind")),
    );
    // another device's praise lands inside the window and is matched first
    assert!(eventually(|| sync.praise_log()[0].canonical_id.as_ref() == Some(&other)).await);

    let outcome = sync.push(&record).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Confirmed(CanonicalId::new("doc-000001")));
    assert!(!remote.log().iter().any(|op| matches!(op, RemoteOp::Delete { .. })));
    assert_eq!(remote.documents(&path).len(), 2);

    remote.redeliver(&path);
    assert!(eventually(|| sync.praise_log().len() == 2).await);
    let log = sync.praise_log();
    assert_unique_canonical_ids(&log);
    let own = log.iter().find(|r| r.local_id == record.local_id).unwrap();
    assert_eq!(own.canonical_id, Some(CanonicalId::new("doc-000001")));
    assert!(log.iter().any(|r| r.canonical_id.as_ref() == Some(&other)));
}

#[tokio::test]
async fn test_redelivery_past_log_cap_does_not_notify() {
    suppress_logs();
    let remote = Arc::new(MemoryRemoteStore::new());
    let config = SyncConfig::default().with_max_log_entries(2);
    let sync = SyncCoordinator::new(config, Arc::clone(&remote), LocalCache::in_memory()).unwrap();
    let scope = class_a();
    sync.start_sync(scope.clone()).await.unwrap();

    let path = scope.remote_path(Collection::PraiseLog);
    for (id, created_at) in [("R1", 1_000), ("R2", 2_000), ("R3", 3_000)] {
        remote.seed(&path, remote_document(&scope, id, created_at, praise("s1", id)));
    }
    let newest = CanonicalId::new("R3");
    assert!(eventually(|| {
        let log = sync.praise_log();
        log.len() == 2 && log[0].canonical_id.as_ref() == Some(&newest)
    })
    .await);

    let before = sync.praise_log();
    let mut changes = sync.subscribe(Topic::Collection(Collection::PraiseLog));
    remote.redeliver(&path);
    remote.redeliver(&path);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sync.praise_log(), before);
    assert!(changes.drain().is_empty(), "capped redelivery must not notify");
}

#[tokio::test]
async fn test_other_device_writes_are_inserted_sorted() {
    let (sync, remote) = setup();
    let scope = class_a();
    sync.start_sync(scope.clone()).await.unwrap();

    let path = scope.remote_path(Collection::PraiseLog);
    remote.seed(&path, remote_document(&scope, "R1", 1_000, praise("s1", "kind")));
    remote.seed(&path, remote_document(&scope, "R3", 3_000, praise("s2", "kind")));
    remote.seed(&path, remote_document(&scope, "R2", 2_000, praise("s3", "kind")));

    assert!(eventually(|| sync.praise_log().len() == 3).await);
    let log = sync.praise_log();
    assert_sorted_newest_first(&log);
    assert_eq!(log[0].canonical_id, Some(CanonicalId::new("R3")));
    assert_unique_canonical_ids(&log);
}

#[tokio::test]
async fn test_malformed_documents_are_skipped() {
    let (sync, remote) = setup();
    let scope = class_a();
    sync.start_sync(scope.clone()).await.unwrap();

    let path = scope.remote_path(Collection::PraiseLog);
    remote.push_raw(
        &path,
        vec![
            serde_json::json!({ "kind": "praise", "ownerId": "teacher-1" }),
            serde_json::json!("not an object"),
            remote_document(&scope, "R1", 1_000, praise("s1", "kind")),
        ],
    );

    assert!(eventually(|| sync.praise_log().len() == 1).await);
}
