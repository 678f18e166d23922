//! Adapter boundary for the hosted real-time document store
//!
//! The store is treated as unreliable and eventually consistent: writes may
//! fail, subscriptions deliver at least once, and ordering is only promised
//! within a single subscription.

use async_trait::async_trait;
use cp_common::{CanonicalId, OwnerScope};
use futures_util::stream::BoxStream;
use serde_json::Value;

/// Failure reported by the remote store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network drop, timeout, offline. Retried through the offline queue.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Permission denied or invalid write. Never retried.
    #[error("remote rejected operation: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// One delivery of a subscription: raw documents, possibly malformed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub documents: Vec<Value>,
}

impl Snapshot {
    pub fn new(documents: Vec<Value>) -> Self {
        Self { documents }
    }
}

/// Live snapshot feed. Dropping the stream stops delivery.
pub type SnapshotStream = BoxStream<'static, Snapshot>;

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Create or overwrite a document. A document carrying an `id` field
    /// overwrites that document; otherwise the store assigns a new id.
    async fn write(&self, path: &str, document: Value) -> Result<CanonicalId, RemoteError>;

    async fn delete(&self, path: &str, id: &CanonicalId) -> Result<(), RemoteError>;

    /// Open a long-lived subscription on `path` filtered to `scope`. The
    /// current state is delivered first, then every subsequent change.
    async fn subscribe(&self, path: &str, scope: &OwnerScope) -> Result<SnapshotStream, RemoteError>;
}
