//! In-process [`RemoteStore`] used by tests, demos and offline development
//!
//! Behaves like the hosted store from the client's point of view: it assigns
//! canonical ids, filters subscriptions by scope and pushes the full scoped
//! contents of a path to every subscriber after each change. It can also be
//! switched offline, made to reject a path, or told to hold write
//! acknowledgments so the subscription echo arrives first.

use crate::remote::{RemoteError, RemoteStore, Snapshot, SnapshotStream};
use async_trait::async_trait;
use cp_common::{CanonicalId, OwnerScope};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// An operation the store accepted, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOp {
    Write {
        path: String,
        id: CanonicalId,
        document: Value,
    },
    Delete {
        path: String,
        id: CanonicalId,
    },
}

struct Subscriber {
    path: String,
    scope: OwnerScope,
    tx: mpsc::UnboundedSender<Snapshot>,
}

#[derive(Default)]
struct StoreState {
    documents: BTreeMap<String, BTreeMap<String, Value>>,
    subscribers: Vec<Subscriber>,
    rejected_paths: HashSet<String>,
    next_id: u64,
    log: Vec<RemoteOp>,
}

pub struct MemoryRemoteStore {
    state: Mutex<StoreState>,
    online: AtomicBool,
    acks_held: watch::Sender<bool>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (acks_held, _) = watch::channel(false);
        Self {
            state: Mutex::new(StoreState::default()),
            online: AtomicBool::new(true),
            acks_held,
        }
    }

    /// While offline every write and delete fails transiently
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Permanently reject writes and deletes on `path`
    pub fn reject_path(&self, path: impl Into<String>) {
        self.lock().rejected_paths.insert(path.into());
    }

    /// Apply writes and push echoes, but do not return from `write` until
    /// [`release_acks`](Self::release_acks) is called.
    pub fn hold_acks(&self) {
        self.acks_held.send_replace(true);
    }

    pub fn release_acks(&self) {
        self.acks_held.send_replace(false);
    }

    /// Every accepted operation in arrival order
    pub fn log(&self) -> Vec<RemoteOp> {
        self.lock().log.clone()
    }

    /// Current documents under `path`, ordered by id
    pub fn documents(&self, path: &str) -> Vec<Value> {
        self.lock()
            .documents
            .get(path)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Store a document as if written by another device
    pub fn seed(&self, path: &str, document: Value) -> CanonicalId {
        let mut state = self.lock();
        let id = Self::store(&mut state, path, document);
        Self::broadcast(&mut state, path);
        id
    }

    /// Push the current contents of `path` again (at-least-once delivery)
    pub fn redeliver(&self, path: &str) {
        Self::broadcast(&mut self.lock(), path);
    }

    /// Push raw documents to every subscriber of `path`, ignoring scope
    /// filters. Models a late delivery from a stale listener.
    pub fn push_raw(&self, path: &str, documents: Vec<Value>) {
        let mut state = self.lock();
        let snapshot = Snapshot::new(documents);
        state
            .subscribers
            .retain(|sub| sub.path != path || sub.tx.send(snapshot.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_path(&self, state: &StoreState, path: &str) -> Result<(), RemoteError> {
        if !self.is_online() {
            return Err(RemoteError::Transient("remote store unreachable".into()));
        }
        if state.rejected_paths.contains(path) {
            return Err(RemoteError::Rejected(format!("permission denied on {}", path)));
        }
        Ok(())
    }

    fn store(state: &mut StoreState, path: &str, mut document: Value) -> CanonicalId {
        let id = match document.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                state.next_id += 1;
                format!("doc-{:06}", state.next_id)
            }
        };
        if let Some(obj) = document.as_object_mut() {
            obj.insert("id".into(), Value::String(id.clone()));
        }

        let id = CanonicalId::new(id);
        state.log.push(RemoteOp::Write {
            path: path.to_string(),
            id: id.clone(),
            document: document.clone(),
        });
        state
            .documents
            .entry(path.to_string())
            .or_default()
            .insert(id.to_string(), document);
        id
    }

    fn scoped(
        documents: &BTreeMap<String, BTreeMap<String, Value>>,
        path: &str,
        scope: &OwnerScope,
    ) -> Snapshot {
        let owned_by_scope = |doc: &&Value| {
            doc.get("ownerId").and_then(Value::as_str) == Some(scope.owner_id.as_str())
                && doc.get("classId").and_then(Value::as_str) == Some(scope.class_id.as_str())
        };
        let documents = documents
            .get(path)
            .map(|docs| docs.values().filter(owned_by_scope).cloned().collect())
            .unwrap_or_default();
        Snapshot::new(documents)
    }

    fn broadcast(state: &mut StoreState, path: &str) {
        let StoreState {
            documents,
            subscribers,
            ..
        } = state;
        subscribers.retain(|sub| {
            sub.path != path || sub.tx.send(Self::scoped(documents, path, &sub.scope)).is_ok()
        });
    }

    async fn wait_for_ack_release(&self) {
        let mut held = self.acks_held.subscribe();
        while *held.borrow_and_update() {
            if held.changed().await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn write(&self, path: &str, document: Value) -> Result<CanonicalId, RemoteError> {
        let id = {
            let mut state = self.lock();
            self.check_path(&state, path)?;
            if !document.is_object() {
                return Err(RemoteError::Rejected("document must be an object".into()));
            }
            let id = Self::store(&mut state, path, document);
            Self::broadcast(&mut state, path);
            id
        };

        self.wait_for_ack_release().await;
        Ok(id)
    }

    async fn delete(&self, path: &str, id: &CanonicalId) -> Result<(), RemoteError> {
        let mut state = self.lock();
        self.check_path(&state, path)?;

        let removed = state
            .documents
            .get_mut(path)
            .and_then(|docs| docs.remove(id.as_str()))
            .is_some();
        state.log.push(RemoteOp::Delete {
            path: path.to_string(),
            id: id.clone(),
        });
        if removed {
            Self::broadcast(&mut state, path);
        }
        Ok(())
    }

    async fn subscribe(&self, path: &str, scope: &OwnerScope) -> Result<SnapshotStream, RemoteError> {
        if !self.is_online() {
            return Err(RemoteError::Transient("remote store unreachable".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            let initial = Self::scoped(&state.documents, path, scope);
            // receiver is alive here, the initial send cannot fail
            let _ = tx.send(initial);
            state.subscribers.push(Subscriber {
                path: path.to_string(),
                scope: scope.clone(),
                tx,
            });
        }

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|snapshot| (snapshot, rx))
        });
        Ok(stream.boxed())
    }
}
