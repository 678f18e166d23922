//! Local persistent cache of entity collections
//!
//! The cache is best-effort, not authoritative: a missing or corrupt entry
//! reads as an empty list. Every successful `set` publishes exactly one
//! [`ChangeEvent`] even when the content did not change, so callers that care
//! about UI churn compare before writing.

use crate::backend::{KvBackend, MemoryBackend};
use crate::bus::{ChangeBus, ChangeEvent, Topic};
use cp_common::{Collection, OwnerScope};
use serde::de::DeserializeOwned;
use serde::Serialize;

const QUEUE_KEY: &str = "_queue";

/// Address of one stored list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Collection {
        scope: OwnerScope,
        collection: Collection,
    },
    OfflineQueue,
}

impl CacheKey {
    pub fn collection(scope: &OwnerScope, collection: Collection) -> Self {
        CacheKey::Collection {
            scope: scope.clone(),
            collection,
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            CacheKey::Collection { scope, collection } => {
                format!("{}/{}", scope.storage_prefix(), collection.key())
            }
            CacheKey::OfflineQueue => QUEUE_KEY.to_string(),
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            CacheKey::Collection { collection, .. } => Topic::Collection(*collection),
            CacheKey::OfflineQueue => Topic::OfflineQueue,
        }
    }

    fn scope(&self) -> Option<&OwnerScope> {
        match self {
            CacheKey::Collection { scope, .. } => Some(scope),
            CacheKey::OfflineQueue => None,
        }
    }
}

pub struct LocalCache {
    backend: Box<dyn KvBackend>,
    bus: ChangeBus,
}

impl LocalCache {
    pub fn new(backend: impl KvBackend + 'static, bus: ChangeBus) -> Self {
        Self {
            backend: Box::new(backend),
            bus,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new(), ChangeBus::new())
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Stored list, or empty if absent or unreadable
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Vec<T> {
        let storage_key = key.storage_key();
        let raw = match self.backend.get(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", storage_key, e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<T>>(&raw) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(
                    "Cache entry {} is corrupt ({}), treating as empty",
                    storage_key,
                    e
                );
                Vec::new()
            }
        }
    }

    /// Overwrite the list stored under `key` and publish one change event
    pub fn set<T: Serialize>(&mut self, key: &CacheKey, items: &[T]) -> crate::Result<()> {
        let storage_key = key.storage_key();
        let raw = serde_json::to_string(items)?;
        self.backend.set(&storage_key, &raw)?;

        tracing::trace!("Cache set {} ({} entries)", storage_key, items.len());
        self.bus.publish(ChangeEvent {
            topic: key.topic(),
            scope: key.scope().cloned(),
            len: items.len(),
        });
        Ok(())
    }

    /// Scopes that have at least one stored collection
    pub fn scopes(&self) -> crate::Result<Vec<OwnerScope>> {
        let mut scopes: Vec<OwnerScope> = self
            .backend
            .keys("")?
            .into_iter()
            .filter_map(|key| {
                let mut parts = key.splitn(3, '/');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(owner), Some(class), Some(_)) => Some(OwnerScope::new(owner, class)),
                    _ => None,
                }
            })
            .collect();
        scopes.dedup();
        Ok(scopes)
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache").field("bus", &self.bus).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_common::{Record, RecordBody};

    fn praise_key() -> CacheKey {
        CacheKey::collection(&OwnerScope::new("t1", "c1"), Collection::PraiseLog)
    }

    fn record() -> Record {
        Record::new_at(
            OwnerScope::new("t1", "c1"),
            RecordBody::Praise {
                student_id: "s1".into(),
                category: "kind".into(),
                amount: 1,
                note: None,
            },
            10,
        )
    }

    #[test]
    fn test_roundtrip_and_notify() {
        let mut cache = LocalCache::in_memory();
        let mut sub = cache.bus().subscribe(Topic::Collection(Collection::PraiseLog));

        let records = vec![record()];
        cache.set(&praise_key(), &records).unwrap();
        assert_eq!(cache.get::<Record>(&praise_key()), records);

        let event = sub.try_recv().unwrap();
        assert_eq!(event.len, 1);
        assert_eq!(event.scope, Some(OwnerScope::new("t1", "c1")));
    }

    #[test]
    fn test_unchanged_set_still_notifies() {
        let mut cache = LocalCache::in_memory();
        let mut sub = cache.bus().subscribe(Topic::Collection(Collection::PraiseLog));
        let records = vec![record()];

        cache.set(&praise_key(), &records).unwrap();
        cache.set(&praise_key(), &records).unwrap();
        assert_eq!(sub.drain().len(), 2);
    }

    #[test]
    fn test_corrupt_entry_reads_empty() {
        let mut backend = MemoryBackend::new();
        backend.set("t1/c1/praise_log", "{not json").unwrap();
        let cache = LocalCache::new(backend, ChangeBus::new());

        assert!(cache.get::<Record>(&praise_key()).is_empty());
        assert!(cache.get::<Record>(&CacheKey::OfflineQueue).is_empty());
    }

    #[test]
    fn test_scopes_are_partitioned() {
        let mut cache = LocalCache::in_memory();
        let other = CacheKey::collection(&OwnerScope::new("t1", "c2"), Collection::PraiseLog);
        cache.set(&praise_key(), &[record()]).unwrap();

        assert!(cache.get::<Record>(&other).is_empty());
        assert_eq!(cache.scopes().unwrap(), vec![OwnerScope::new("t1", "c1")]);
    }
}
