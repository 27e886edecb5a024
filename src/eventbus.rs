//! In-process event bus (C6, §4.6). Per-owner pub/sub delivering
//! `monitor_check`/`incident_created`/`incident_resolved` events to
//! long-lived subscriber streams (browser push), each with its own bounded
//! buffer so one slow subscriber cannot affect another.
//!
//! Grounded in the teacher's `sse.rs`, which uses a single global
//! `tokio::sync::broadcast` channel. A broadcast channel does not fit this
//! spec: a lagging subscriber there causes *every* subscriber to observe a
//! `Lagged` gap, and publish has no notion of "this owner's subscribers
//! only". This is instead a registry of per-subscriber bounded `mpsc`
//! channels keyed by `owner_id`, with a non-blocking `try_send` so a full
//! buffer drops the event for that subscriber alone (§4.6 "Publish
//! contract").

use crate::models::Event;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One item a subscriber stream yields.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Event),
    Heartbeat,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<StreamItem>,
}

/// Process-wide pub/sub state, explicitly owned and threaded into C3/C4 at
/// construction (§9 "Global state" — never an ambient singleton; tests
/// instantiate a fresh one with [`EventBus::new`]).
pub struct EventBus {
    buffer_capacity: usize,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: std::sync::atomic::AtomicU64,
}

/// Handle returned by [`EventBus::subscribe`]; dropping it (or calling
/// [`EventBus::unsubscribe`] explicitly) releases the subscriber slot.
pub struct Subscription {
    bus: std::sync::Weak<EventBus>,
    owner_id: String,
    id: u64,
    pub receiver: mpsc::Receiver<StreamItem>,
}

impl EventBus {
    pub fn new(buffer_capacity: usize) -> Self {
        EventBus {
            buffer_capacity,
            subscribers: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Subscribe to events for `owner_id` (§4.6 "Subscribe contract"). The
    /// returned stream yields events in publish order for that owner plus a
    /// heartbeat every 30s so transport layers can detect dead peers.
    pub fn subscribe(self: &std::sync::Arc<Self>, owner_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut subs = self.subscribers.lock().unwrap();
            subs.entry(owner_id.to_string())
                .or_default()
                .push(Subscriber { id, sender: tx.clone() });
        }
        let bus = self.clone();
        let owner_id_owned = owner_id.to_string();
        tokio::spawn(async move {
            let mut ticker = time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if tx.send(StreamItem::Heartbeat).await.is_err() {
                    break;
                }
                // If the subscriber was unsubscribed, `bus` still holds a
                // clone of this sender in its registry until removed; check
                // membership so the heartbeat task exits promptly.
                let alive = bus
                    .subscribers
                    .lock()
                    .unwrap()
                    .get(&owner_id_owned)
                    .map(|v| v.iter().any(|s| s.id == id))
                    .unwrap_or(false);
                if !alive {
                    break;
                }
            }
        });
        Subscription {
            bus: std::sync::Arc::downgrade(self),
            owner_id: owner_id.to_string(),
            id,
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, sub: &Subscription) {
        self.remove_subscriber(&sub.owner_id, sub.id);
    }

    fn remove_subscriber(&self, owner_id: &str, id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(owner_id) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(owner_id);
            }
        }
    }

    /// Publish an event (§4.6 "Publish contract"). Non-blocking: never
    /// awaits, never back-pressures the publisher. A full per-subscriber
    /// buffer drops the event for that subscriber only.
    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.lock().unwrap();
        let Some(list) = subs.get(&event.owner_id) else {
            debug!(owner_id = %event.owner_id, "event bus: no subscribers");
            return;
        };
        for sub in list {
            match sub.sender.try_send(StreamItem::Event(event.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(owner_id = %event.owner_id, subscriber = sub.id, "event bus: subscriber buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(owner_id = %event.owner_id, subscriber = sub.id, "event bus: subscriber channel closed");
                }
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, owner_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(owner_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    /// Releases the subscriber slot without requiring the caller to still
    /// hold the bus (the normal case when a browser push stream disconnects
    /// and only this handle goes out of scope).
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_subscriber(&self.owner_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Check, EventKind};
    use chrono::Utc;
    use std::sync::Arc;

    fn sample_check(monitor_id: &str) -> Check {
        Check {
            id: "c1".into(),
            monitor_id: monitor_id.into(),
            checked_at: Utc::now(),
            success: true,
            status_code: Some(200),
            response_time_ms: Some(42),
            ssl_valid: None,
            ssl_expires_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn delivers_only_to_subscribed_owner() {
        let bus = Arc::new(EventBus::new(10));
        let mut sub_a = bus.subscribe("owner-a");
        let mut sub_b = bus.subscribe("owner-b");

        bus.publish(Event {
            owner_id: "owner-a".into(),
            kind: EventKind::MonitorCheck { check: sample_check("m1") },
        });

        let item = tokio::time::timeout(Duration::from_millis(200), sub_a.recv())
            .await
            .unwrap();
        assert!(matches!(item, Some(StreamItem::Event(_))));

        // owner-b must not see owner-a's event; only its own heartbeat (if
        // any) could arrive, and within 50ms none will.
        let nothing = tokio::time::timeout(Duration::from_millis(50), sub_b.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_for_that_subscriber_only() {
        let bus = Arc::new(EventBus::new(1));
        let mut sub = bus.subscribe("owner-a");

        for _ in 0..5 {
            bus.publish(Event {
                owner_id: "owner-a".into(),
                kind: EventKind::MonitorCheck { check: sample_check("m1") },
            });
        }

        // Only the first (buffered) event should be observed; the rest were
        // dropped for this subscriber, not queued.
        let first = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(first.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber_slot() {
        let bus = Arc::new(EventBus::new(10));
        let sub = bus.subscribe("owner-a");
        assert_eq!(bus.subscriber_count("owner-a"), 1);
        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count("owner-a"), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_slot_without_explicit_unsubscribe() {
        let bus = Arc::new(EventBus::new(10));
        let sub = bus.subscribe("owner-a");
        assert_eq!(bus.subscriber_count("owner-a"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("owner-a"), 0);
    }
}
