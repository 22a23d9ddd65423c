//! Live subscriber membership

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Subscriber identifier; allocated in join order and never reused
pub type SubscriberId = u64;

/// Why a frame could not be handed to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Consumer is too far behind
    Full,
    /// Consumer is gone
    Closed,
}

/// Registry-side handle to one broadcast destination
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Arc<str>>,
    done: CancellationToken,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Cancelled once the subscriber has been removed
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Queue a frame without waiting
    pub fn try_deliver(&self, frame: Arc<str>) -> Result<(), DeliveryFailure> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::Full,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }
}

/// Set of live subscribers, ordered by join time
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    members: RwLock<BTreeMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber whose queue already holds `first_frame`
    ///
    /// The frame is enqueued while the membership lock is held, so nothing
    /// fanned out through the registry can overtake it.
    pub fn register(
        &self,
        capacity: usize,
        first_frame: Arc<str>,
    ) -> (Arc<Subscriber>, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Arc::new(Subscriber {
            id,
            sender,
            done: CancellationToken::new(),
        });

        let mut members = self.members.write();
        // A fresh channel has room for at least one frame
        let _ = subscriber.try_deliver(first_frame);
        members.insert(id, subscriber.clone());
        (subscriber, receiver)
    }

    /// Remove a subscriber; only the first call for an id has any effect
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.members.write().remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.done.cancel();
                true
            }
            None => false,
        }
    }

    /// Current members in join order
    ///
    /// Fan-out iterates this copy, so removals during iteration are safe.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.members.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Remove everyone, returning how many were released
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.members.write());
        for subscriber in drained.values() {
            subscriber.done.cancel();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn test_first_frame_queued() {
        let registry = SubscriberRegistry::new();
        let (subscriber, mut rx) = registry.register(4, frame("hello"));
        assert_eq!(rx.try_recv().unwrap().as_ref(), "hello");
        assert_eq!(registry.snapshot()[0].id(), subscriber.id());
    }

    #[test]
    fn test_join_order() {
        let registry = SubscriberRegistry::new();
        let ids: Vec<_> = (0..3)
            .map(|_| registry.register(1, frame("x")).0.id())
            .collect();
        let order: Vec<_> = registry.snapshot().iter().map(|s| s.id()).collect();
        assert_eq!(order, ids);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let (subscriber, _rx) = registry.register(1, frame("x"));
        assert!(registry.remove(subscriber.id()));
        assert!(subscriber.done().is_cancelled());
        assert!(!registry.remove(subscriber.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delivery_failures() {
        let registry = SubscriberRegistry::new();
        let (subscriber, rx) = registry.register(1, frame("first"));
        assert_eq!(
            subscriber.try_deliver(frame("second")),
            Err(DeliveryFailure::Full)
        );
        drop(rx);
        assert_eq!(
            subscriber.try_deliver(frame("third")),
            Err(DeliveryFailure::Closed)
        );
    }

    #[test]
    fn test_clear_releases_all() {
        let registry = SubscriberRegistry::new();
        let (a, _ra) = registry.register(1, frame("x"));
        let (b, _rb) = registry.register(1, frame("x"));
        assert_eq!(registry.clear(), 2);
        assert!(a.done().is_cancelled() && b.done().is_cancelled());
        assert_eq!(registry.len(), 0);
    }
}
