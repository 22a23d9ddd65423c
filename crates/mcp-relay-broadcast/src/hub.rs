//! Event broadcast hub
//!
//! ```text
//! publish(event) ──serialize once──┬──► [queue 1] ──► Subscription 1
//!                                  ├──► [queue 2] ──► Subscription 2
//!                                  └──► [queue N] ──► Subscription N
//! ```
//!
//! - `publish` never waits: frames are handed over with `try_send`
//! - A full or closed queue removes that subscriber; it is never retried
//! - Publishes are serialized, so all subscribers see the same order
//! - Every subscription starts with a `connection_established` snapshot

use crate::registry::{SubscriberId, SubscriberRegistry};
use futures_util::stream::Stream;
use mcp_relay_core::{BridgeSettings, BroadcastEvent, EventSink, SnapshotSource};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Zero disables the heartbeat
    pub heartbeat_interval: Duration,
    pub subscriber_buffer: usize,
}

impl HubConfig {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            subscriber_buffer: settings.subscriber_buffer,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the frame, in membership order
    pub delivered: Vec<SubscriberId>,
    /// Subscribers removed because the write failed
    pub dropped: Vec<SubscriberId>,
}

struct HubInner {
    config: HubConfig,
    registry: SubscriberRegistry,
    source: Arc<dyn SnapshotSource>,
    publish_order: Mutex<()>,
}

impl HubInner {
    fn publish(&self, event: &BroadcastEvent) -> PublishReport {
        let frame: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!(event = %event.event_type, "Failed to serialize broadcast event: {}", e);
                return PublishReport::default();
            }
        };

        let _order = self.publish_order.lock();
        let mut report = PublishReport::default();
        for subscriber in self.registry.snapshot() {
            match subscriber.try_deliver(frame.clone()) {
                Ok(()) => report.delivered.push(subscriber.id()),
                Err(failure) => {
                    warn!(
                        subscriber = subscriber.id(),
                        reason = ?failure,
                        "Broadcast write failed, unsubscribing"
                    );
                    self.registry.remove(subscriber.id());
                    report.dropped.push(subscriber.id());
                }
            }
        }
        debug!(
            event = %event.event_type,
            delivered = report.delivered.len(),
            dropped = report.dropped.len(),
            "Broadcast published"
        );
        report
    }
}

struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Publish point for state-change events
pub struct BroadcastHub {
    inner: Arc<HubInner>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                registry: SubscriberRegistry::new(),
                source,
                publish_order: Mutex::new(()),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    /// Register a new subscriber
    ///
    /// Its first frame is the current snapshot; no publish can precede it.
    pub fn subscribe(&self) -> Subscription {
        let _order = self.inner.publish_order.lock();
        let event = BroadcastEvent::connection_established(self.inner.source.snapshot());
        let first: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize snapshot: {}", e);
                Arc::from("{}")
            }
        };
        let (subscriber, receiver) = self
            .inner
            .registry
            .register(self.inner.config.subscriber_buffer, first);
        info!(
            subscriber = subscriber.id(),
            total = self.inner.registry.len(),
            "Broadcast subscriber connected"
        );

        Subscription {
            id: subscriber.id(),
            receiver,
            done: subscriber.done().clone(),
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Fan an event out to every current subscriber without waiting
    pub fn publish(&self, event: &BroadcastEvent) -> PublishReport {
        self.inner.publish(event)
    }

    /// Remove a subscriber; repeated calls are no-ops
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.registry.remove(id);
        if removed {
            info!(subscriber = id, "Broadcast subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Cloneable sink that publishes into this hub
    pub fn publisher(&self) -> HubPublisher {
        HubPublisher {
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Start the periodic heartbeat
    pub fn start(&self) {
        let period = self.inner.config.heartbeat_interval;
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() || period.is_zero() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.publish(&BroadcastEvent::heartbeat());
                    }
                }
            }
            debug!("Heartbeat stopped");
        });
        *heartbeat = Some(Heartbeat { cancel, handle });
        info!(interval = ?period, "Broadcast hub started");
    }

    /// Stop the heartbeat and release every subscriber
    pub async fn shutdown(&self) {
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel.cancel();
            let _ = heartbeat.handle.await;
        }
        let released = self.inner.registry.clear();
        info!(released, "Broadcast hub shut down");
    }
}

/// [`EventSink`] handle into a hub
///
/// Holds a weak reference; publishing after the hub is gone is a no-op.
#[derive(Clone)]
pub struct HubPublisher {
    hub: Weak<HubInner>,
}

impl EventSink for HubPublisher {
    fn publish(&self, event: BroadcastEvent) {
        if let Some(hub) = self.hub.upgrade() {
            hub.publish(&event);
        }
    }
}

/// Consumer side of one subscriber
///
/// Yields serialized event frames. Ends when the subscriber is removed or
/// the hub shuts down; dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<str>>,
    done: CancellationToken,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Cancelled once the subscriber has been removed
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Next frame, or `None` once the subscriber is gone
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = Arc<str>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            if hub.registry.remove(self.id) {
                debug!(subscriber = self.id, "Subscription dropped");
            }
        }
    }
}
