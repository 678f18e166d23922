//! Sync coordinator: optimistic writes and subscription lifecycle
//!
//! Local mutations land in the cache immediately and are then written to
//! the remote store; a transient failure parks the write in the offline
//! queue. Live subscriptions feed the reconciler for exactly one owner
//! scope at a time. The write acknowledgment and the subscription echo may
//! arrive in either order; both converge on the same record.

use crate::bus::{BusSubscription, ChangeBus, Topic};
use crate::cache::{CacheKey, LocalCache};
use crate::config::SyncConfig;
use crate::queue::{FlushReport, OfflineQueue, OpKind, PendingOp, ReplayHooks};
use crate::reconcile::{absorb, sort_newest_first, MergeStats, Reconciler};
use crate::remote::{RemoteError, RemoteStore, Snapshot, SnapshotStream};
use crate::{Result, SyncError};
use cp_common::{CanonicalId, Collection, LocalId, OwnerScope, Record, RecordBody, Turn};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Result of a remote write attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote store accepted the write under this id
    Confirmed(CanonicalId),
    /// Saved locally only; the write waits in the offline queue
    Queued { warning: String },
}

impl WriteOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, WriteOutcome::Confirmed(_))
    }

    /// Soft, non-fatal message for the user, if any
    pub fn warning(&self) -> Option<&str> {
        match self {
            WriteOutcome::Queued { warning } => Some(warning),
            WriteOutcome::Confirmed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub local_id: LocalId,
    pub outcome: WriteOutcome,
}

/// Which subscriptions `start_sync` managed to open
#[derive(Debug, Clone)]
pub struct StartReport {
    pub scope: OwnerScope,
    pub subscribed: Vec<Collection>,
    pub failed: Vec<(Collection, RemoteError)>,
}

impl StartReport {
    pub fn is_live(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ActiveSync {
    scope: OwnerScope,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSync {
    fn dispose(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inner<R> {
    config: SyncConfig,
    remote: Arc<R>,
    cache: Arc<Mutex<LocalCache>>,
    bus: ChangeBus,
    queue: OfflineQueue,
    reconciler: Reconciler,
    active: Mutex<Option<ActiveSync>>,
    lifecycle: tokio::sync::Mutex<()>,
    /// Direct writes awaiting their acknowledgment, per record
    writing: Mutex<HashMap<LocalId, usize>>,
    /// Ids the remote store assigned to each record's own writes
    acknowledged: Mutex<HashMap<LocalId, CanonicalId>>,
    /// Provisional records removed before their create was acknowledged
    removed_provisional: Mutex<HashSet<LocalId>>,
    /// Deleted documents a late redelivery must not resurrect
    removed_canonical: Mutex<HashSet<CanonicalId>>,
}

/// Counts one direct write as in flight until dropped
struct InFlight<'a> {
    writing: &'a Mutex<HashMap<LocalId, usize>>,
    local_id: LocalId,
}

impl<'a> InFlight<'a> {
    fn begin(writing: &'a Mutex<HashMap<LocalId, usize>>, local_id: &LocalId) -> Self {
        *lock(writing).entry(local_id.clone()).or_default() += 1;
        Self {
            writing,
            local_id: local_id.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut writing = lock(self.writing);
        if let Some(count) = writing.get_mut(&self.local_id) {
            *count -= 1;
            if *count == 0 {
                writing.remove(&self.local_id);
            }
        }
    }
}

/// Where an acknowledgment left the record it was written for
struct Confirmation {
    /// Id the record is now known by
    kept: CanonicalId,
    /// Redundant remote document to delete
    orphan: Option<CanonicalId>,
}

/// Entry point for consuming layers
pub struct SyncCoordinator<R: RemoteStore> {
    inner: Arc<Inner<R>>,
}

impl<R: RemoteStore> Clone for SyncCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: RemoteStore> SyncCoordinator<R> {
    pub fn new(config: SyncConfig, remote: Arc<R>, cache: LocalCache) -> Result<Self> {
        config.validate()?;

        let bus = cache.bus().clone();
        let cache = Arc::new(Mutex::new(cache));
        let reconciler = Reconciler::new(config.dedup_window);

        Ok(Self {
            inner: Arc::new(Inner {
                queue: OfflineQueue::new(Arc::clone(&cache)),
                config,
                remote,
                cache,
                bus,
                reconciler,
                active: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                writing: Mutex::new(HashMap::new()),
                acknowledged: Mutex::new(HashMap::new()),
                removed_provisional: Mutex::new(HashSet::new()),
                removed_canonical: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn active_scope(&self) -> Option<OwnerScope> {
        self.inner.active_scope()
    }

    /// Change notifications for one collection (or the offline queue)
    pub fn subscribe(&self, topic: Topic) -> BusSubscription {
        self.inner.bus.subscribe(topic)
    }

    // ---------------------------------------------------------------------
    // Subscription lifecycle
    // ---------------------------------------------------------------------

    /// Make `scope` the active scope and open one subscription per tracked
    /// collection. Any previous scope is stopped first.
    ///
    /// Local operations work even when some subscriptions could not be
    /// opened; those are listed in the report and can be retried by calling
    /// `start_sync` again.
    pub async fn start_sync(&self, scope: OwnerScope) -> Result<StartReport> {
        scope.validate()?;
        let _lifecycle = self.inner.lifecycle.lock().await;

        self.stop_sync();
        *lock(&self.inner.active) = Some(ActiveSync {
            scope: scope.clone(),
            tasks: Vec::new(),
        });
        tracing::info!("Starting sync for {}", scope);

        let mut report = StartReport {
            scope: scope.clone(),
            subscribed: Vec::new(),
            failed: Vec::new(),
        };

        for &collection in &self.inner.config.tracked {
            let path = scope.remote_path(collection);
            match self.inner.remote.subscribe(&path, &scope).await {
                Ok(stream) => {
                    let task = tokio::spawn(pump(
                        Arc::downgrade(&self.inner),
                        scope.clone(),
                        collection,
                        stream,
                    ));
                    match lock(&self.inner.active).as_mut() {
                        Some(active) if active.scope == scope => active.tasks.push(task),
                        // stopped while we were subscribing
                        _ => task.abort(),
                    }
                    report.subscribed.push(collection);
                }
                Err(e) => {
                    tracing::warn!("Could not subscribe to {}: {}", path, e);
                    report.failed.push((collection, e));
                }
            }
        }

        Ok(report)
    }

    /// Dispose every subscription of the active scope and clear it.
    /// A snapshot already being merged finishes first.
    ///
    /// Removal tombstones are dropped too, except for deletes still waiting
    /// in the offline queue and creates still waiting for their ack.
    pub fn stop_sync(&self) {
        let previous = lock(&self.inner.active).take();
        if let Some(active) = previous {
            tracing::info!("Stopping sync for {}", active.scope);
            active.dispose();
        }
        self.inner.release_tombstones();
    }

    /// Merge a snapshot into the active scope. Subscriptions call this
    /// internally; it is public for adapters that poll instead of push.
    pub fn apply_snapshot(&self, collection: Collection, snapshot: &Snapshot) -> Option<MergeStats> {
        let scope = self.active_scope()?;
        self.inner.apply_snapshot(&scope, collection, snapshot)
    }

    // ---------------------------------------------------------------------
    // Optimistic writes
    // ---------------------------------------------------------------------

    /// Insert a provisional record into the active scope without touching
    /// the network
    pub fn stage(&self, body: RecordBody) -> Result<Record> {
        self.inner.stage(body)
    }

    /// Send a staged or updated record to the remote store
    pub async fn push(&self, record: &Record) -> Result<WriteOutcome> {
        self.inner.push(record).await
    }

    /// Stage then push. A permanent rejection rolls the local insert back.
    pub async fn create(&self, body: RecordBody) -> Result<WriteReceipt> {
        let record = self.inner.stage(body)?;
        match self.inner.push(&record).await {
            Ok(outcome) => Ok(WriteReceipt {
                local_id: record.local_id,
                outcome,
            }),
            Err(e @ SyncError::Rejected(_)) => {
                tracing::error!("Create of {} rejected, rolling back: {}", record.local_id, e);
                self.inner.discard_local(&record.scope, record.collection(), &record.local_id)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn award_praise(
        &self,
        student_id: &str,
        category: &str,
        amount: i64,
        note: Option<String>,
    ) -> Result<WriteReceipt> {
        self.create(RecordBody::Praise {
            student_id: student_id.to_string(),
            category: category.to_string(),
            amount,
            note,
        })
        .await
    }

    pub async fn check_in(&self, student_id: &str, emotion: &str, message: &str) -> Result<WriteReceipt> {
        self.create(RecordBody::EmotionCheckIn {
            student_id: student_id.to_string(),
            emotion: emotion.to_string(),
            turns: vec![Turn::new(message)],
        })
        .await
    }

    pub async fn notify(&self, student_id: &str, title: &str, body: &str) -> Result<WriteReceipt> {
        self.create(RecordBody::Notification {
            student_id: student_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        })
        .await
    }

    /// Create the student, or update the existing profile with that id
    pub async fn upsert_student(
        &self,
        student_id: &str,
        name: &str,
        points: i64,
        pet: Option<String>,
    ) -> Result<WriteReceipt> {
        let body = RecordBody::Student {
            student_id: student_id.to_string(),
            name: name.to_string(),
            points,
            pet,
        };

        let existing = self
            .students()
            .into_iter()
            .find(|r| r.body.student_id() == student_id);

        match existing {
            Some(record) => {
                let outcome = self
                    .update(Collection::Students, &record.local_id, |current| {
                        *current = body;
                        Ok(())
                    })
                    .await?;
                Ok(WriteReceipt {
                    local_id: record.local_id,
                    outcome,
                })
            }
            None => self.create(body).await,
        }
    }

    /// Edit a record in place, then write it through.
    ///
    /// Edits to a record whose create is not yet confirmed are queued; the
    /// replay addresses them at the canonical id once it is known.
    pub async fn update<F>(&self, collection: Collection, local_id: &LocalId, edit: F) -> Result<WriteOutcome>
    where
        F: FnOnce(&mut RecordBody) -> Result<()>,
    {
        let scope = self.active_scope().ok_or(SyncError::NoActiveScope)?;
        let mut updated = None;

        self.inner.edit_collection(&scope, collection, |records| {
            let record = records
                .iter_mut()
                .find(|r| r.local_id == *local_id)
                .ok_or_else(|| SyncError::RecordNotFound(local_id.clone()))?;

            let kind = record.body.kind();
            edit(&mut record.body)?;
            if record.body.kind() != kind {
                return Err(SyncError::InvalidOperation(format!(
                    "cannot turn a {} into a {}",
                    kind,
                    record.body.kind()
                )));
            }
            updated = Some(record.clone());
            Ok(())
        })?;

        let record = updated.ok_or_else(|| SyncError::RecordNotFound(local_id.clone()))?;
        if record.is_provisional() {
            self.inner.queue.enqueue(PendingOp::write(&record)?)?;
            return Ok(WriteOutcome::Queued {
                warning: "Saved locally; waiting for the original entry to sync".into(),
            });
        }
        self.inner.push(&record).await
    }

    /// Set the teacher reply on one turn of a check-in
    pub async fn reply_to_check_in(&self, local_id: &LocalId, turn: usize, reply: &str) -> Result<WriteOutcome> {
        self.update(Collection::EmotionLog, local_id, |body| {
            turn_mut(body, turn)?.teacher_reply = Some(reply.to_string());
            Ok(())
        })
        .await
    }

    /// Append a new student message to a check-in conversation
    pub async fn add_student_turn(&self, local_id: &LocalId, message: &str) -> Result<WriteOutcome> {
        self.update(Collection::EmotionLog, local_id, |body| {
            body.turns_mut()
                .ok_or_else(|| SyncError::InvalidOperation("not an emotion check-in".into()))?
                .push(Turn::new(message));
            Ok(())
        })
        .await
    }

    pub async fn mark_reply_read(&self, local_id: &LocalId, turn: usize) -> Result<WriteOutcome> {
        self.update(Collection::EmotionLog, local_id, |body| {
            turn_mut(body, turn)?.read = true;
            Ok(())
        })
        .await
    }

    /// Remove a record locally and cascade a remote delete.
    ///
    /// A record that never reached the remote store only loses its queued
    /// writes; if its create is still in flight, the acknowledgment triggers
    /// the delete instead.
    pub async fn remove(&self, collection: Collection, local_id: &LocalId) -> Result<()> {
        let scope = self.active_scope().ok_or(SyncError::NoActiveScope)?;
        let mut removed = None;

        self.inner.edit_collection(&scope, collection, |records| {
            let idx = records
                .iter()
                .position(|r| r.local_id == *local_id)
                .ok_or_else(|| SyncError::RecordNotFound(local_id.clone()))?;
            let record = records.remove(idx);
            // checked under the cache lock so a concurrent ack sees it
            if record.is_provisional() && self.inner.awaits_ack(local_id) {
                lock(&self.inner.removed_provisional).insert(local_id.clone());
            }
            removed = Some(record);
            Ok(())
        })?;

        let record = removed.ok_or_else(|| SyncError::RecordNotFound(local_id.clone()))?;
        lock(&self.inner.acknowledged).remove(&record.local_id);
        let dropped = self.inner.queue.discard_for(&scope, &record.local_id)?;
        tracing::debug!("Removed {} ({} queued ops dropped)", record.local_id, dropped);

        match record.canonical_id {
            Some(id) => {
                self.inner
                    .delete_remote(&scope, collection, Some(record.local_id), id)
                    .await
            }
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Offline queue
    // ---------------------------------------------------------------------

    /// Replay the offline queue. Creates the remote store rejects are
    /// rolled back locally and returned in the report.
    pub async fn flush_offline_queue(&self) -> FlushReport {
        let report = self
            .inner
            .queue
            .flush(self.inner.remote.as_ref(), self.inner.as_ref())
            .await;

        for rejected in &report.rejected {
            let op = &rejected.op;
            if op.kind != OpKind::Write {
                continue;
            }
            let Some(local_id) = &op.local_id else {
                continue;
            };
            if self.inner.canonical_for(op).is_none() {
                tracing::warn!("Rolling back {} after rejection: {}", local_id, rejected.reason);
                if let Err(e) = self.inner.discard_local(&op.scope, op.collection, local_id) {
                    tracing::error!("Rollback of {} failed: {}", local_id, e);
                }
            }
        }
        report
    }

    /// Connectivity-restored signal from the platform
    pub async fn on_connectivity_restored(&self) -> FlushReport {
        tracing::info!(
            "Connectivity restored, replaying {} queued ops",
            self.inner.queue.len()
        );
        self.flush_offline_queue().await
    }

    /// Background retry of the offline queue every `flush_interval`.
    /// Stops by itself once the coordinator is dropped.
    pub fn spawn_periodic_flush(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.queue.is_empty() {
                    continue;
                }
                let coordinator = SyncCoordinator { inner };
                let report = coordinator.flush_offline_queue().await;
                if let Some(e) = report.halted {
                    tracing::debug!("Periodic flush halted: {}", e);
                }
            }
        })
    }

    // ---------------------------------------------------------------------
    // Read accessors (never block on the network)
    // ---------------------------------------------------------------------

    /// Last merged state of a collection in the active scope
    pub fn records(&self, collection: Collection) -> Vec<Record> {
        match self.active_scope() {
            Some(scope) => self.records_in(&scope, collection),
            None => Vec::new(),
        }
    }

    pub fn records_in(&self, scope: &OwnerScope, collection: Collection) -> Vec<Record> {
        lock(&self.inner.cache).get(&CacheKey::collection(scope, collection))
    }

    pub fn students(&self) -> Vec<Record> {
        self.records(Collection::Students)
    }

    pub fn praise_log(&self) -> Vec<Record> {
        self.records(Collection::PraiseLog)
    }

    pub fn emotion_log(&self) -> Vec<Record> {
        self.records(Collection::EmotionLog)
    }

    pub fn notifications(&self) -> Vec<Record> {
        self.records(Collection::Notifications)
    }

    pub fn pending_ops(&self) -> Vec<PendingOp> {
        self.inner.queue.pending()
    }
}

fn turn_mut(body: &mut RecordBody, index: usize) -> Result<&mut Turn> {
    body.turns_mut()
        .ok_or_else(|| SyncError::InvalidOperation("not an emotion check-in".into()))?
        .get_mut(index)
        .ok_or_else(|| SyncError::InvalidOperation(format!("check-in has no turn {}", index)))
}

/// Feed one subscription into the reconciler until it ends or is aborted
async fn pump<R: RemoteStore>(
    inner: Weak<Inner<R>>,
    scope: OwnerScope,
    collection: Collection,
    mut stream: SnapshotStream,
) {
    while let Some(snapshot) = stream.next().await {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        strong.apply_snapshot(&scope, collection, &snapshot);
    }
    tracing::debug!("Subscription {} for {} ended", collection, scope);
}

impl<R: RemoteStore> Inner<R> {
    fn active_scope(&self) -> Option<OwnerScope> {
        lock(&self.active).as_ref().map(|a| a.scope.clone())
    }

    fn apply_snapshot(
        &self,
        scope: &OwnerScope,
        collection: Collection,
        snapshot: &Snapshot,
    ) -> Option<MergeStats> {
        if self.active_scope().as_ref() != Some(scope) {
            tracing::debug!("Discarding {} snapshot for inactive scope {}", collection, scope);
            return None;
        }

        let documents = self.without_removed(&snapshot.documents);
        let key = CacheKey::collection(scope, collection);
        let mut cache = lock(&self.cache);
        let local: Vec<Record> = cache.get(&key);
        let outcome = self.reconciler.merge(scope, collection, local.clone(), &documents);

        // entries past the cap come back on every delivery
        let records = self.capped(collection, outcome.records);
        if records != local {
            if let Err(e) = cache.set(&key, &records) {
                tracing::warn!("Could not persist merged {}: {}", collection, e);
            }
        }
        Some(outcome.stats)
    }

    fn without_removed(&self, documents: &[Value]) -> Vec<Value> {
        let removed = lock(&self.removed_canonical);
        documents
            .iter()
            .filter(|doc| {
                doc.get("id")
                    .and_then(Value::as_str)
                    .map_or(true, |id| !removed.contains(&CanonicalId::from(id)))
            })
            .cloned()
            .collect()
    }

    fn capped(&self, collection: Collection, mut records: Vec<Record>) -> Vec<Record> {
        if collection.is_log() && records.len() > self.config.max_log_entries {
            records.truncate(self.config.max_log_entries);
        }
        records
    }

    /// Apply `edit` to a collection, re-sort, cap and persist if anything changed
    fn edit_collection<F>(&self, scope: &OwnerScope, collection: Collection, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Record>) -> Result<()>,
    {
        let key = CacheKey::collection(scope, collection);
        let mut cache = lock(&self.cache);
        let before: Vec<Record> = cache.get(&key);
        let mut records = before.clone();

        edit(&mut records)?;
        sort_newest_first(&mut records);
        let records = self.capped(collection, records);

        if records != before {
            cache.set(&key, &records)?;
        }
        Ok(())
    }

    fn stage(&self, body: RecordBody) -> Result<Record> {
        let scope = self.active_scope().ok_or(SyncError::NoActiveScope)?;
        let record = Record::new(scope, body);
        self.edit_collection(&record.scope, record.collection(), |records| {
            records.push(record.clone());
            Ok(())
        })?;
        tracing::debug!("Staged {} in {}", record.local_id, record.collection());
        Ok(record)
    }

    async fn push(&self, record: &Record) -> Result<WriteOutcome> {
        let collection = record.collection();
        let path = record.scope.remote_path(collection);
        let document = record.to_document()?;
        let _in_flight = InFlight::begin(&self.writing, &record.local_id);

        match self.remote.write(&path, document).await {
            Ok(id) => {
                let confirmation = self.confirm(&record.scope, collection, &record.local_id, &id)?;
                if let Some(orphan) = confirmation.orphan {
                    // the write itself succeeded; a failed cleanup must not undo it
                    if let Err(e) = self.delete_remote(&record.scope, collection, None, orphan.clone()).await {
                        tracing::warn!("Could not delete redundant {}: {}", orphan, e);
                    }
                }
                Ok(WriteOutcome::Confirmed(confirmation.kept))
            }
            Err(e) if e.is_transient() => {
                self.queue.enqueue(PendingOp::write(record)?)?;
                let warning = format!("Saved locally; will sync when the connection returns ({})", e);
                tracing::warn!("{}: {}", record.local_id, warning);
                Ok(WriteOutcome::Queued { warning })
            }
            Err(e) => Err(SyncError::Rejected(e.to_string())),
        }
    }

    /// Attach the acknowledged `id` to the record written as `local_id`.
    ///
    /// The ack is redundant, and its document is returned for deletion, when
    /// the record was removed while the write was in flight or when an
    /// earlier write of the same record was already acknowledged under a
    /// different id. An id the record only picked up by heuristic match
    /// belongs to another device's document; it is released so the next
    /// snapshot inserts that document on its own.
    fn confirm(
        &self,
        scope: &OwnerScope,
        collection: Collection,
        local_id: &LocalId,
        id: &CanonicalId,
    ) -> Result<Confirmation> {
        let mut confirmation = Confirmation {
            kept: id.clone(),
            orphan: None,
        };

        self.edit_collection(scope, collection, |records| {
            let removed_early = lock(&self.removed_provisional).remove(local_id);
            let Some(idx) = records.iter().position(|r| r.local_id == *local_id) else {
                if removed_early {
                    // an echo may have been inserted meanwhile
                    records.retain(|r| r.canonical_id.as_ref() != Some(id));
                    confirmation.orphan = Some(id.clone());
                } else {
                    tracing::debug!("{} no longer cached, ignoring ack {}", local_id, id);
                }
                return Ok(());
            };

            let mut acknowledged = lock(&self.acknowledged);
            match records[idx].canonical_id.clone() {
                Some(existing) if existing == *id => {}
                Some(existing) if acknowledged.get(local_id) == Some(&existing) => {
                    tracing::warn!(
                        "{} already confirmed as {}, dropping duplicate {}",
                        local_id,
                        existing,
                        id
                    );
                    records.retain(|r| r.local_id == *local_id || r.canonical_id.as_ref() != Some(id));
                    confirmation.kept = existing;
                    confirmation.orphan = Some(id.clone());
                    return Ok(());
                }
                previous => {
                    if let Some(foreign) = previous {
                        tracing::info!("{} was written as {}, releasing match {}", local_id, id, foreign);
                    }
                    if let Some(dup) = records.iter().position(|r| r.canonical_id.as_ref() == Some(id)) {
                        // echo arrived outside the dedup window and was inserted
                        let echo = records.remove(dup);
                        tracing::debug!("Folding {} into {}", echo.local_id, local_id);
                        if let Some(own) = records.iter_mut().find(|r| r.local_id == *local_id) {
                            absorb(&mut own.body, &echo.body);
                        }
                    }
                    if let Some(own) = records.iter_mut().find(|r| r.local_id == *local_id) {
                        own.canonical_id = Some(id.clone());
                    }
                }
            }
            acknowledged.insert(local_id.clone(), id.clone());
            Ok(())
        })?;

        if let Some(orphan) = &confirmation.orphan {
            lock(&self.removed_canonical).insert(orphan.clone());
        }
        Ok(confirmation)
    }

    async fn delete_remote(
        &self,
        scope: &OwnerScope,
        collection: Collection,
        local_id: Option<LocalId>,
        id: CanonicalId,
    ) -> Result<()> {
        lock(&self.removed_canonical).insert(id.clone());
        let path = scope.remote_path(collection);

        match self.remote.delete(&path, &id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!("Delete of {} queued: {}", id, e);
                self.queue
                    .enqueue(PendingOp::delete(scope, collection, local_id, id))
            }
            Err(e) => Err(SyncError::Rejected(e.to_string())),
        }
    }

    /// Drop a record that will never be confirmed
    fn discard_local(&self, scope: &OwnerScope, collection: Collection, local_id: &LocalId) -> Result<()> {
        self.edit_collection(scope, collection, |records| {
            records.retain(|r| r.local_id != *local_id);
            Ok(())
        })?;
        lock(&self.acknowledged).remove(local_id);
        self.queue.discard_for(scope, local_id)?;
        Ok(())
    }

    /// Whether a write of `local_id` can still be acknowledged
    fn awaits_ack(&self, local_id: &LocalId) -> bool {
        lock(&self.writing).contains_key(local_id) || self.queue.is_replaying(local_id)
    }

    fn release_tombstones(&self) {
        let queued: HashSet<CanonicalId> = self
            .queue
            .pending()
            .into_iter()
            .filter(|op| op.kind == OpKind::Delete)
            .filter_map(|op| op.canonical_id)
            .collect();
        lock(&self.removed_canonical).retain(|id| queued.contains(id));
        lock(&self.removed_provisional).retain(|local_id| self.awaits_ack(local_id));
        lock(&self.acknowledged).clear();
    }
}

impl<R: RemoteStore> ReplayHooks for Inner<R> {
    fn canonical_for(&self, op: &PendingOp) -> Option<CanonicalId> {
        let local_id = op.local_id.as_ref()?;
        let records: Vec<Record> = lock(&self.cache).get(&CacheKey::collection(&op.scope, op.collection));
        records
            .into_iter()
            .find(|r| r.local_id == *local_id)
            .and_then(|r| r.canonical_id)
    }

    fn on_written(&self, op: &PendingOp, id: &CanonicalId) {
        let Some(local_id) = &op.local_id else {
            return;
        };
        match self.confirm(&op.scope, op.collection, local_id, id) {
            Ok(Confirmation {
                orphan: Some(orphan),
                ..
            }) => {
                let delete = PendingOp::delete(&op.scope, op.collection, None, orphan);
                if let Err(e) = self.queue.enqueue(delete) {
                    tracing::error!("Could not queue delete of duplicate: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not record confirmation of {}: {}", local_id, e),
        }
    }
}

impl<R> Drop for Inner<R> {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            active.dispose();
        }
    }
}
