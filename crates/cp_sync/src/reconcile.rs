//! Merging remote snapshots into locally cached collections
//!
//! For each inbound document, in order:
//!
//! 1. **Exact match** on canonical id: take the remote payload in place,
//!    keeping read latches and unsent local turns.
//! 2. **Heuristic match**: an unconfirmed local record of the same scope and
//!    kind, with the same subject and discriminant, created less than the
//!    dedup window apart. It adopts the canonical id. This is what keeps a
//!    locally authored record from showing up twice when the subscription
//!    echoes it back before (or instead of) the write acknowledgment.
//! 3. **New**: insert with a fresh local id.
//!
//! Documents that fail to parse, belong to another scope or to another
//! collection are skipped; the merge itself never fails. Applying the same
//! snapshot twice yields the same list as applying it once.

use cp_common::{Collection, OwnerScope, Record, RecordBody, RemoteRecord};
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;

/// Per-pass counters, mostly for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Exact matches whose content changed
    pub updated: usize,
    /// Exact matches already up to date
    pub unchanged: usize,
    /// Provisional records confirmed by heuristic match
    pub adopted: usize,
    pub inserted: usize,
    pub malformed: usize,
    pub foreign_scope: usize,
    pub wrong_collection: usize,
}

impl MergeStats {
    pub fn skipped(&self) -> usize {
        self.malformed + self.foreign_scope + self.wrong_collection
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Merged list, sorted newest first
    pub records: Vec<Record>,
    pub stats: MergeStats,
    /// Whether `records` differs from the input list
    pub changed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    window_ms: i64,
}

impl Reconciler {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(0) as u64)
    }

    /// Merge raw snapshot documents for `collection` into `local`
    pub fn merge(
        &self,
        active: &OwnerScope,
        collection: Collection,
        local: Vec<Record>,
        documents: &[Value],
    ) -> MergeOutcome {
        let mut stats = MergeStats::default();
        let mut inbound = Vec::with_capacity(documents.len());

        for doc in documents {
            match RemoteRecord::from_document(doc) {
                Ok(remote) if remote.scope != *active => {
                    tracing::warn!(
                        "Dropping {} from scope {} (active: {})",
                        remote.canonical_id,
                        remote.scope,
                        active
                    );
                    stats.foreign_scope += 1;
                }
                Ok(remote) if remote.body.collection() != collection => {
                    tracing::debug!(
                        "Dropping {}: {} document in {}",
                        remote.canonical_id,
                        remote.body.kind(),
                        collection
                    );
                    stats.wrong_collection += 1;
                }
                Ok(remote) => inbound.push(remote),
                Err(e) => {
                    tracing::warn!("Skipping malformed document in {}: {}", collection, e);
                    stats.malformed += 1;
                }
            }
        }

        let mut outcome = self.merge_records(local, inbound);
        outcome.stats.malformed += stats.malformed;
        outcome.stats.foreign_scope += stats.foreign_scope;
        outcome.stats.wrong_collection += stats.wrong_collection;
        outcome
    }

    /// Merge already-parsed remote records. Callers own scope filtering.
    pub fn merge_records(&self, local: Vec<Record>, inbound: Vec<RemoteRecord>) -> MergeOutcome {
        let before = local.clone();
        let mut records = local;
        let mut stats = MergeStats::default();

        for remote in inbound {
            self.merge_one(&mut records, remote, &mut stats);
        }

        sort_newest_first(&mut records);
        let changed = records != before;

        tracing::debug!(
            "Merged snapshot: {} updated, {} adopted, {} inserted",
            stats.updated,
            stats.adopted,
            stats.inserted
        );
        MergeOutcome {
            records,
            stats,
            changed,
        }
    }

    fn merge_one(&self, records: &mut Vec<Record>, remote: RemoteRecord, stats: &mut MergeStats) {
        if let Some(local) = records
            .iter_mut()
            .find(|r| r.canonical_id.as_ref() == Some(&remote.canonical_id))
        {
            let previous = local.body.clone();
            local.body.merge_remote(&remote.body);
            if local.body == previous {
                stats.unchanged += 1;
            } else {
                stats.updated += 1;
            }
            return;
        }

        if let Some(idx) = self.heuristic_match(records, &remote) {
            let local = &mut records[idx];
            tracing::debug!(
                "Confirmed provisional {} as {}",
                local.local_id,
                remote.canonical_id
            );
            local.canonical_id = Some(remote.canonical_id);
            absorb(&mut local.body, &remote.body);
            stats.adopted += 1;
            return;
        }

        records.push(Record::from_remote(remote));
        stats.inserted += 1;
    }

    /// Closest unconfirmed candidate by creation time; earlier list position
    /// (newer record) breaks ties.
    fn heuristic_match(&self, records: &[Record], remote: &RemoteRecord) -> Option<usize> {
        let key = remote.body.dedup_key();
        records
            .iter()
            .enumerate()
            .filter(|(_, local)| {
                local.is_provisional()
                    && local.scope == remote.scope
                    && local.body.dedup_key() == key
                    && (local.created_at - remote.created_at).abs() < self.window_ms
            })
            .min_by_key(|(idx, local)| ((local.created_at - remote.created_at).abs(), *idx))
            .map(|(idx, _)| idx)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Fold a remote body into a local one.
///
/// Trivially different content (whitespace, invisible characters) keeps the
/// locally entered text; anything else adopts the remote fields. Read latches
/// are OR-ed either way.
pub fn absorb(local: &mut RecordBody, remote: &RecordBody) {
    if local.trivially_equals(remote) {
        local.latch_reads_from(remote);
    } else {
        local.merge_remote(remote);
    }
}

/// Newest first; canonical id then local id break ties deterministically
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(compare_newest_first);
}

fn compare_newest_first(a: &Record, b: &Record) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.canonical_id.cmp(&b.canonical_id))
        .then_with(|| a.local_id.cmp(&b.local_id))
}
