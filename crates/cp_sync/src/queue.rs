//! Offline operation queue
//!
//! Remote operations that failed transiently are persisted in FIFO order
//! and replayed one at a time when connectivity returns. A transient failure
//! halts the replay at that operation; a permanent rejection drops the
//! operation and reports it, so nothing is retried forever and nothing is
//! lost silently.

use crate::cache::{CacheKey, LocalCache};
use crate::remote::{RemoteError, RemoteStore};
use cp_common::{CanonicalId, Collection, LocalId, OwnerScope, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Write,
    Delete,
}

/// A remote operation waiting for connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    pub op_id: String,
    pub kind: OpKind,
    pub collection: Collection,
    pub scope: OwnerScope,
    /// Local record the operation belongs to, if any
    #[serde(default)]
    pub local_id: Option<LocalId>,
    #[serde(default)]
    pub canonical_id: Option<CanonicalId>,
    /// Remote document for writes, `null` for deletes
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: i64,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingOp {
    pub fn write(record: &Record) -> crate::Result<Self> {
        Ok(Self {
            op_id: LocalId::generate().to_string(),
            kind: OpKind::Write,
            collection: record.collection(),
            scope: record.scope.clone(),
            local_id: Some(record.local_id.clone()),
            canonical_id: record.canonical_id.clone(),
            payload: record.to_document()?,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
        })
    }

    pub fn delete(
        scope: &OwnerScope,
        collection: Collection,
        local_id: Option<LocalId>,
        id: CanonicalId,
    ) -> Self {
        Self {
            op_id: LocalId::generate().to_string(),
            kind: OpKind::Delete,
            collection,
            scope: scope.clone(),
            local_id,
            canonical_id: Some(id),
            payload: Value::Null,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
        }
    }

    pub fn path(&self) -> String {
        self.scope.remote_path(self.collection)
    }

    fn targets(&self, scope: &OwnerScope, local_id: &LocalId) -> bool {
        self.scope == *scope && self.local_id.as_ref() == Some(local_id)
    }

    /// Address this operation at an already-confirmed document
    fn attach_canonical(&mut self, id: &CanonicalId) {
        self.canonical_id = Some(id.clone());
        if let Some(obj) = self.payload.as_object_mut() {
            obj.insert("id".into(), Value::String(id.to_string()));
        }
    }
}

/// An operation the remote store refused permanently
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedOp {
    pub op: PendingOp,
    pub reason: String,
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub applied: usize,
    pub rejected: Vec<RejectedOp>,
    pub remaining: usize,
    /// The transient failure that stopped the pass early
    pub halted: Option<RemoteError>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none() && self.remaining == 0
    }
}

/// Callbacks into the owner of the local records during a replay
pub trait ReplayHooks {
    /// Canonical id the record behind `op` has acquired since it was queued
    fn canonical_for(&self, op: &PendingOp) -> Option<CanonicalId>;

    /// A queued write was accepted and assigned `id`
    fn on_written(&self, op: &PendingOp, id: &CanonicalId);
}

pub struct OfflineQueue {
    cache: Arc<Mutex<LocalCache>>,
    flush_gate: tokio::sync::Mutex<()>,
    /// Record whose queued write is currently being sent
    replaying: Mutex<Option<LocalId>>,
}

impl OfflineQueue {
    pub fn new(cache: Arc<Mutex<LocalCache>>) -> Self {
        Self {
            cache,
            flush_gate: tokio::sync::Mutex::new(()),
            replaying: Mutex::new(None),
        }
    }

    /// Append an operation and persist the queue.
    ///
    /// A write for a record that already has a queued write replaces that
    /// entry's payload in place, keeping its position.
    pub fn enqueue(&self, op: PendingOp) -> crate::Result<()> {
        self.update(|ops| {
            let existing = match (&op.kind, &op.local_id) {
                (OpKind::Write, Some(local_id)) => ops
                    .iter_mut()
                    .find(|p| p.kind == OpKind::Write && p.targets(&op.scope, local_id)),
                _ => None,
            };

            match existing {
                Some(pending) => {
                    tracing::debug!("Coalescing queued write {}", pending.op_id);
                    pending.payload = op.payload;
                    if let Some(id) = op.canonical_id.as_ref() {
                        pending.attach_canonical(id);
                    }
                }
                None => {
                    tracing::debug!("Queued {:?} on {}", op.kind, op.path());
                    ops.push(op);
                }
            }
        })
    }

    /// Drop every queued operation for a record that is being removed.
    /// Returns how many were dropped.
    pub fn discard_for(&self, scope: &OwnerScope, local_id: &LocalId) -> crate::Result<usize> {
        let mut dropped = 0;
        self.update(|ops| {
            let before = ops.len();
            ops.retain(|op| !op.targets(scope, local_id));
            dropped = before - ops.len();
        })?;
        Ok(dropped)
    }

    /// Whether a replayed write for `local_id` is waiting for its
    /// acknowledgment right now
    pub fn is_replaying(&self, local_id: &LocalId) -> bool {
        self.replaying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            == Some(local_id)
    }

    pub fn pending(&self) -> Vec<PendingOp> {
        self.lock_cache().get(&CacheKey::OfflineQueue)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay queued operations in enqueue order, one at a time.
    ///
    /// Concurrent calls are serialized. Operations enqueued while a flush is
    /// running are picked up by the same pass.
    pub async fn flush<R, H>(&self, remote: &R, hooks: &H) -> FlushReport
    where
        R: RemoteStore + ?Sized,
        H: ReplayHooks + ?Sized,
    {
        let _gate = self.flush_gate.lock().await;
        let mut report = FlushReport::default();

        while let Some(mut op) = self.pending().into_iter().next() {
            if op.canonical_id.is_none() {
                if let Some(id) = hooks.canonical_for(&op) {
                    op.attach_canonical(&id);
                }
            }

            let path = op.path();
            self.set_replaying(match op.kind {
                OpKind::Write => op.local_id.clone(),
                OpKind::Delete => None,
            });
            let result = match (op.kind, op.canonical_id.clone()) {
                (OpKind::Write, _) => remote.write(&path, op.payload.clone()).await.map(Some),
                (OpKind::Delete, Some(id)) => remote.delete(&path, &id).await.map(|_| None),
                // nothing was ever stored remotely
                (OpKind::Delete, None) => Ok(None),
            };

            match result {
                Ok(written) => {
                    if let Err(e) = self.complete(&op, written.as_ref()) {
                        tracing::error!("Failed to persist queue after replay: {}", e);
                        report.halted = Some(RemoteError::Transient(e.to_string()));
                        break;
                    }
                    if let Some(id) = &written {
                        hooks.on_written(&op, id);
                    }
                    self.set_replaying(None);
                    report.applied += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Replay of {} halted: {}", op.op_id, e);
                    if let Err(persist) = self.update(|ops| {
                        if let Some(p) = ops.iter_mut().find(|p| p.op_id == op.op_id) {
                            p.attempts += 1;
                        }
                    }) {
                        tracing::warn!("Failed to persist attempt count for {}: {}", op.op_id, persist);
                    }
                    report.halted = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::error!("Dropping {} after permanent rejection: {}", op.op_id, e);
                    if let Err(persist) = self.update(|ops| ops.retain(|p| p.op_id != op.op_id)) {
                        tracing::error!("Failed to persist queue after rejection: {}", persist);
                        report.halted = Some(RemoteError::Transient(persist.to_string()));
                        break;
                    }
                    report.rejected.push(RejectedOp {
                        op,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.set_replaying(None);
        report.remaining = self.len();
        tracing::info!(
            "Queue flush: {} applied, {} rejected, {} remaining",
            report.applied,
            report.rejected.len(),
            report.remaining
        );
        report
    }

    /// Remove a replayed operation, unless it was coalesced with newer
    /// content while in flight; then keep it, now addressed at `written`.
    fn complete(&self, sent: &PendingOp, written: Option<&CanonicalId>) -> crate::Result<()> {
        self.update(|ops| {
            let Some(idx) = ops.iter().position(|p| p.op_id == sent.op_id) else {
                return;
            };
            let stale = ops[idx].kind == OpKind::Write && !same_content(&ops[idx], sent);
            match (stale, written) {
                (true, Some(id)) => ops[idx].attach_canonical(id),
                (true, None) => {}
                (false, _) => {
                    ops.remove(idx);
                }
            }
        })
    }

    fn set_replaying(&self, local_id: Option<LocalId>) {
        *self.replaying.lock().unwrap_or_else(PoisonError::into_inner) = local_id;
    }

    fn update(&self, f: impl FnOnce(&mut Vec<PendingOp>)) -> crate::Result<()> {
        let mut cache = self.lock_cache();
        let mut ops: Vec<PendingOp> = cache.get(&CacheKey::OfflineQueue);
        f(&mut ops);
        cache.set(&CacheKey::OfflineQueue, &ops)
    }

    fn lock_cache(&self) -> MutexGuard<'_, LocalCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Payload equality ignoring the `id` a replay may have attached
fn same_content(stored: &PendingOp, sent: &PendingOp) -> bool {
    let strip = |v: &Value| {
        let mut v = v.clone();
        if let Some(obj) = v.as_object_mut() {
            obj.remove("id");
        }
        v
    };
    strip(&stored.payload) == strip(&sent.payload)
}
