//! # ClassPoints Sync Engine
//!
//! Local-first synchronization of classroom activity records.
//!
//! ## Architecture
//!
//! - **LocalCache**: key/value persisted collections, partitioned per owner scope
//! - **ChangeBus**: per-topic change notifications for reactive consumers
//! - **RemoteStore**: adapter trait over the hosted real-time document store
//! - **OfflineQueue**: ordered, persisted replay of writes that could not be sent
//! - **Reconciler**: merges remote snapshots into the cache without duplicates
//! - **SyncCoordinator**: optimistic writes and subscription lifecycle
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cp_common::OwnerScope;
//! use cp_sync::{LocalCache, MemoryRemoteStore, SyncConfig, SyncCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let remote = Arc::new(MemoryRemoteStore::new());
//!     let sync = SyncCoordinator::new(SyncConfig::default(), remote, LocalCache::in_memory())?;
//!
//!     sync.start_sync(OwnerScope::new("teacher-1", "class-4b")).await?;
//!     sync.award_praise("student-7", "kind", 1, None).await?;
//!     println!("{} praise entries", sync.praise_log().len());
//!
//!     sync.stop_sync();
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod memory;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod sqlite;

pub use backend::{KvBackend, MemoryBackend};
pub use bus::{BusSubscription, ChangeBus, ChangeEvent, Topic};
pub use cache::{CacheKey, LocalCache};
pub use config::SyncConfig;
pub use coordinator::{StartReport, SyncCoordinator, WriteOutcome, WriteReceipt};
pub use memory::{MemoryRemoteStore, RemoteOp};
pub use queue::{FlushReport, OfflineQueue, OpKind, PendingOp, RejectedOp, ReplayHooks};
pub use reconcile::{MergeOutcome, MergeStats, Reconciler};
pub use remote::{RemoteError, RemoteStore, Snapshot, SnapshotStream};
pub use sqlite::SqliteBackend;

use cp_common::{CpError, LocalId};

/// Common result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("No owner scope is active; call start_sync first")]
    NoActiveScope,

    #[error("Record not found: {0}")]
    RecordNotFound(LocalId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Remote store rejected the operation: {0}")]
    Rejected(String),

    #[error("Cache backend error: {0}")]
    CacheError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error(transparent)]
    Common(#[from] CpError),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::CacheError(e.to_string())
    }
}
