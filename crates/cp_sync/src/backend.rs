//! Key/value persistence primitives behind [`LocalCache`](crate::LocalCache)
//!
//! Backends are synchronous and know nothing about records; they store
//! serialized text under string keys.

use std::collections::BTreeMap;

/// Synchronous key -> serialized text store
pub trait KvBackend: Send {
    fn get(&self, key: &str) -> crate::Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> crate::Result<()>;

    fn remove(&mut self, key: &str) -> crate::Result<()>;

    /// All keys starting with `prefix`, sorted
    fn keys(&self, prefix: &str) -> crate::Result<Vec<String>>;
}

/// Volatile backend for tests and ephemeral sessions
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    entries: BTreeMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> crate::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> crate::Result<Vec<String>> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
