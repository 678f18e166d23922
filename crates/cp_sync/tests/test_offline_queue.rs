use cp_common::{Collection, RecordBody};
use cp_sync::{
    ChangeBus, LocalCache, MemoryRemoteStore, OpKind, RemoteOp, SqliteBackend, SyncConfig,
    SyncCoordinator,
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

fn written_categories(remote: &MemoryRemoteStore) -> Vec<String> {
    remote
        .log()
        .into_iter()
        .filter_map(|op| match op {
            RemoteOp::Write { document, .. } => document["category"].as_str().map(str::to_string),
            RemoteOp::Delete { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn test_offline_writes_replay_in_order() {
    let (sync, remote) = setup();
    sync.start_sync(scope("teacher-1", "class-a")).await.unwrap();
    remote.set_online(false);

    for category in ["first", "second", "third"] {
        let receipt = sync.award_praise("s1", category, 1, None).await.unwrap();
        assert!(receipt.outcome.warning().is_some());
    }
    assert_eq!(sync.pending_ops().len(), 3);
    assert!(sync.praise_log().iter().all(|r| r.is_provisional()));

    remote.set_online(true);
    let report = sync.on_connectivity_restored().await;

    assert!(report.is_complete());
    assert_eq!(report.applied, 3);
    assert_eq!(written_categories(&remote), vec!["first", "second", "third"]);
    assert!(sync.pending_ops().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let log = sync.praise_log();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|r| !r.is_provisional()));
    assert_unique_canonical_ids(&log);
}

#[tokio::test]
async fn test_flush_halts_while_still_offline() {
    let (sync, remote) = setup();
    sync.start_sync(scope("teacher-1", "class-a")).await.unwrap();
    remote.set_online(false);
    sync.award_praise("s1", "kind", 1, None).await.unwrap();

    let report = sync.flush_offline_queue().await;
    assert!(report.halted.is_some());
    assert_eq!(report.applied, 0);
    assert_eq!(sync.pending_ops()[0].attempts, 1);
}

#[tokio::test]
async fn test_edits_to_unsynced_record_coalesce() {
    let (sync, remote) = setup();
    let scope = scope("teacher-1", "class-a");
    sync.start_sync(scope.clone()).await.unwrap();
    remote.set_online(false);

    let receipt = sync.check_in("s1", "happy", "Good day").await.unwrap();
    sync.reply_to_check_in(&receipt.local_id, 0, "Great!").await.unwrap();
    assert_eq!(sync.pending_ops().len(), 1);

    remote.set_online(true);
    let report = sync.flush_offline_queue().await;
    assert_eq!(report.applied, 1);

    let stored = remote.documents(&scope.remote_path(Collection::EmotionLog));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["turns"][0]["teacherReply"], "Great!");
}

#[tokio::test]
async fn test_removing_unsynced_record_drops_its_writes() {
    let (sync, remote) = setup();
    sync.start_sync(scope("teacher-1", "class-a")).await.unwrap();
    remote.set_online(false);

    let receipt = sync.award_praise("s1", "oops", 1, None).await.unwrap();
    sync.remove(Collection::PraiseLog, &receipt.local_id).await.unwrap();

    assert!(sync.praise_log().is_empty());
    assert!(sync.pending_ops().is_empty());

    remote.set_online(true);
    sync.flush_offline_queue().await;
    assert!(remote.log().is_empty());
}

#[tokio::test]
async fn test_remove_confirmed_record_cascades() {
    let (sync, remote) = setup();
    let scope = scope("teacher-1", "class-a");
    sync.start_sync(scope.clone()).await.unwrap();

    let receipt = sync.award_praise("s1", "kind", 1, None).await.unwrap();
    sync.remove(Collection::PraiseLog, &receipt.local_id).await.unwrap();

    let path = scope.remote_path(Collection::PraiseLog);
    assert!(remote.documents(&path).is_empty());
    assert!(matches!(remote.log().last(), Some(RemoteOp::Delete { .. })));

    // a stale listener still holding the document must not bring it back
    remote.push_raw(&path, vec![remote_document(&scope, "doc-000001", 1_000, praise("s1", "kind"))]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sync.praise_log().is_empty());
}

#[tokio::test]
async fn test_offline_delete_is_queued() {
    let (sync, remote) = setup();
    sync.start_sync(scope("teacher-1", "class-a")).await.unwrap();

    let receipt = sync.award_praise("s1", "kind", 1, None).await.unwrap();
    remote.set_online(false);
    sync.remove(Collection::PraiseLog, &receipt.local_id).await.unwrap();

    let pending = sync.pending_ops();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OpKind::Delete);

    remote.set_online(true);
    assert!(sync.flush_offline_queue().await.is_complete());
    assert!(matches!(remote.log().last(), Some(RemoteOp::Delete { .. })));
}

#[tokio::test]
async fn test_rejected_replay_rolls_back_create() {
    let (sync, remote) = setup();
    let scope = scope("teacher-1", "class-a");
    sync.start_sync(scope.clone()).await.unwrap();
    remote.set_online(false);
    sync.notify("s1", "Pet fed", "Your pet is happy").await.unwrap();

    remote.reject_path(scope.remote_path(Collection::Notifications));
    remote.set_online(true);
    let report = sync.flush_offline_queue().await;

    assert_eq!(report.rejected.len(), 1);
    assert!(sync.notifications().is_empty());
    assert!(sync.pending_ops().is_empty());
}

#[tokio::test]
async fn test_queue_survives_restart_with_sqlite() {
    suppress_logs();
    let workspace = init_workspace();
    let db = workspace.path().join(".classpoints").join("cache.db");
    let scope = scope("teacher-1", "class-a");
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_online(false);

    {
        let cache = LocalCache::new(SqliteBackend::open(&db).unwrap(), ChangeBus::new());
        let sync = SyncCoordinator::new(SyncConfig::default(), Arc::clone(&remote), cache).unwrap();
        sync.start_sync(scope.clone()).await.unwrap();
        sync.award_praise("s1", "kind", 1, None).await.unwrap();
        sync.stop_sync();
    }

    remote.set_online(true);
    let cache = LocalCache::new(SqliteBackend::open(&db).unwrap(), ChangeBus::new());
    let sync = SyncCoordinator::new(SyncConfig::default(), Arc::clone(&remote), cache).unwrap();
    assert_eq!(sync.pending_ops().len(), 1);
    assert_eq!(sync.records_in(&scope, Collection::PraiseLog).len(), 1);

    let report = sync.on_connectivity_restored().await;
    assert_eq!(report.applied, 1);
    assert!(!sync.records_in(&scope, Collection::PraiseLog)[0].is_provisional());
}

#[tokio::test]
async fn test_periodic_flush_retries_in_background() {
    suppress_logs();
    let remote = Arc::new(MemoryRemoteStore::new());
    let mut config = SyncConfig::default();
    config.flush_interval = Duration::from_millis(20);
    let sync = SyncCoordinator::new(config, Arc::clone(&remote), LocalCache::in_memory()).unwrap();
    sync.start_sync(scope("teacher-1", "class-a")).await.unwrap();

    remote.set_online(false);
    sync.upsert_student("s1", "Mai", 0, None).await.unwrap();
    let flusher = sync.spawn_periodic_flush();
    remote.set_online(true);

    assert!(eventually(|| sync.pending_ops().is_empty()).await);
    assert!(eventually(|| sync.students().iter().all(|r| !r.is_provisional())).await);
    flusher.abort();
}

#[tokio::test]
async fn test_upsert_student_updates_existing_profile() {
    let (sync, remote) = setup();
    let scope = scope("teacher-1", "class-a");
    sync.start_sync(scope.clone()).await.unwrap();

    let first = sync.upsert_student("s1", "Mai", 0, None).await.unwrap();
    let second = sync.upsert_student("s1", "Mai", 5, Some("cat".into())).await.unwrap();
    assert_eq!(first.local_id, second.local_id);

    let students = sync.students();
    assert_eq!(students.len(), 1);
    assert!(matches!(students[0].body, RecordBody::Student { points: 5, .. }));
    assert_eq!(remote.documents(&scope.remote_path(Collection::Students)).len(), 1);
}
