//! In-process change notifications
//!
//! Every [`LocalCache`](crate::LocalCache) write publishes one [`ChangeEvent`]
//! on the topic of the key it wrote. Subscribers receive events through their
//! own unbounded channel, so per-topic delivery order matches write order.
//! Dropping a [`BusSubscription`] unsubscribes it.

use cp_common::{Collection, OwnerScope};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Collection(Collection),
    OfflineQueue,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Collection(c) => f.write_str(c.key()),
            Topic::OfflineQueue => f.write_str("offline_queue"),
        }
    }
}

/// Published after a collection was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub topic: Topic,
    /// Scope of the written partition; `None` for scope-less keys
    pub scope: Option<OwnerScope>,
    /// Number of entries now stored
    pub len: usize,
}

type Subscribers = HashMap<Topic, Vec<(u64, UnboundedSender<ChangeEvent>)>>;

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribers: Subscribers,
}

/// Publish/subscribe hub keyed by [`Topic`]
#[derive(Clone, Default)]
pub struct ChangeBus {
    state: Arc<Mutex<BusState>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.entry(topic).or_default().push((id, tx));

        BusSubscription {
            id,
            topic,
            rx,
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Deliver `event` to every live subscriber of its topic.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut state = self.lock();
        let Some(subs) = state.subscribers.get_mut(&event.topic) else {
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subs.len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock().subscribers.get(&topic).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ChangeBus")
            .field("topics", &state.subscribers.len())
            .finish()
    }
}

/// Receiving end of a bus subscription; dropping it is the disposer
#[derive(Debug)]
pub struct BusSubscription {
    id: u64,
    topic: Topic,
    rx: UnboundedReceiver<ChangeEvent>,
    bus: Weak<Mutex<BusState>>,
}

impl BusSubscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything delivered so far
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        let Some(state) = self.bus.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = state.subscribers.get_mut(&self.topic) {
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: Topic, len: usize) -> ChangeEvent {
        ChangeEvent {
            topic,
            scope: None,
            len,
        }
    }

    #[test]
    fn test_delivery_in_publish_order() {
        let bus = ChangeBus::new();
        let topic = Topic::Collection(Collection::PraiseLog);
        let mut sub = bus.subscribe(topic);

        for len in 1..=3 {
            assert_eq!(bus.publish(event(topic, len)), 1);
        }

        let lens: Vec<usize> = sub.drain().into_iter().map(|e| e.len).collect();
        assert_eq!(lens, vec![1, 2, 3]);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = ChangeBus::new();
        let mut praise = bus.subscribe(Topic::Collection(Collection::PraiseLog));
        bus.publish(event(Topic::OfflineQueue, 1));
        assert!(praise.try_recv().is_none());
    }

    #[test]
    fn test_drop_disposes() {
        let bus = ChangeBus::new();
        let topic = Topic::OfflineQueue;
        let sub = bus.subscribe(topic);
        let _other = bus.subscribe(topic);
        assert_eq!(bus.subscriber_count(topic), 2);

        drop(sub);
        assert_eq!(bus.subscriber_count(topic), 1);
        assert_eq!(bus.publish(event(topic, 0)), 1);
    }
}
