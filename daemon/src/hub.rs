//! Change notification fan-out.
//!
//! Tracks subscribers and forwards every [`ChangeEvent`] the coordinator
//! emits to the ones interested in its channel.

use std::sync::Arc;

use beancache_engine::{Channel, ChangeEvent, Notifier};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender half handed to the hub for one subscriber.
pub type EventSender = mpsc::UnboundedSender<ChangeEvent>;

/// Receiver half returned to the subscriber.
pub type EventReceiver = mpsc::UnboundedReceiver<ChangeEvent>;

#[derive(Debug)]
struct Subscriber {
    /// Only events for this channel, or every event when `None`
    channel: Option<Channel>,
    sender: EventSender,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        self.channel.as_deref().map_or(true, |c| c == event.channel)
    }
}

/// Fans change events out to subscribers.
///
/// Thread-safe and can be shared with the coordinator via `Arc`. Sending never
/// blocks, so it is safe to call while the coordinator holds a bean lock.
#[derive(Debug, Default)]
pub struct NotificationHub {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to events, optionally for one channel only.
    pub fn subscribe(&self, channel: Option<&str>) -> (Uuid, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                channel: channel.map(str::to_string),
                sender,
            },
        );
        tracing::debug!(subscriber = %id, channel = ?channel, "Subscriber registered");
        (id, receiver)
    }

    /// Returns whether the subscriber existed.
    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver an event. Subscribers whose receiver is gone are dropped.
    ///
    /// Returns the number of subscribers that received it.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let mut sent = 0;
        self.subscribers.retain(|id, sub| {
            if !sub.wants(event) {
                return true;
            }
            if sub.sender.send(event.clone()).is_ok() {
                sent += 1;
                true
            } else {
                tracing::debug!(subscriber = %id, "Dropping closed subscriber");
                false
            }
        });

        tracing::trace!(
            channel = %event.channel,
            id = %event.id,
            recipients = sent,
            "Broadcast change event"
        );
        sent
    }
}

impl Notifier for NotificationHub {
    fn notify(&self, event: ChangeEvent) {
        self.broadcast(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beancache_engine::{BeanKey, ChangeKind};

    fn event(channel: &str, id: &str) -> ChangeEvent {
        ChangeEvent::new(&BeanKey::new(channel, id), ChangeKind::Updated)
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let hub = NotificationHub::new();
        let (id, _rx) = hub.subscribe(None);
        assert_eq!(hub.subscriber_count(), 1);

        assert!(hub.unsubscribe(&id));
        assert!(!hub.unsubscribe(&id));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_channel_filter() {
        let hub = NotificationHub::new();
        let (_, mut all) = hub.subscribe(None);
        let (_, mut orders) = hub.subscribe(Some("orders"));

        assert_eq!(hub.broadcast(&event("users", "u-1")), 1);
        assert_eq!(hub.broadcast(&event("orders", "o-1")), 2);

        assert_eq!(all.try_recv().unwrap().id, "u-1");
        assert_eq!(all.try_recv().unwrap().id, "o-1");
        assert_eq!(orders.try_recv().unwrap().id, "o-1");
        assert!(orders.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscribers_are_dropped() {
        let hub = NotificationHub::new();
        let (_, rx) = hub.subscribe(None);
        let (_, mut kept) = hub.subscribe(None);
        drop(rx);

        hub.notify(event("orders", "o-1"));
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap().kind, ChangeKind::Updated);
    }
}
