use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use ember_types::events::{ChannelEvent, EventKind};

/// What a subscriber wants to see. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub room: Option<Uuid>,
    pub kinds: Option<HashSet<EventKind>>,
}

impl SubscriptionFilter {
    pub fn room(room_id: Uuid) -> Self {
        Self {
            room: Some(room_id),
            kinds: None,
        }
    }

    pub fn kind(kind: EventKind) -> Self {
        Self {
            room: None,
            kinds: Some(HashSet::from([kind])),
        }
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kinds.get_or_insert_with(HashSet::new).insert(kind);
        self
    }

    fn matches(&self, event: &ChannelEvent) -> bool {
        if let Some(room) = self.room {
            if event.room_id() != room {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

/// A live subscription. Dropping the receiver is enough to stop delivery;
/// `Dispatcher::unsubscribe` removes the registration eagerly.
pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Typed event fan-out. Subscribers register independently of the connection
/// lifecycle, so registrations survive reconnects; each subscriber gets its
/// own channel and events are cloned per matching subscriber.
#[derive(Clone)]
pub struct Dispatcher {
    subscribers: Arc<RwLock<HashMap<Uuid, Subscriber>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .insert(id, Subscriber { filter, tx });
        Subscription { id, events: rx }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().await.remove(&id);
    }

    /// Deliver one inbound event to every matching subscriber. Subscribers
    /// whose receiver has been dropped are pruned on the way through.
    pub async fn deliver(&self, event: &ChannelEvent) {
        let mut dead: Vec<Uuid> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (&id, sub) in subscribers.iter() {
                if !sub.filter.matches(event) {
                    continue;
                }
                if sub.tx.send(event.clone()).is_err() {
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt_in_event(room: Uuid) -> ChannelEvent {
        ChannelEvent::HostOptIn {
            room_id: room,
            session_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_room_filter_scopes_delivery() {
        let dispatcher = Dispatcher::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();

        let mut sub = dispatcher.subscribe(SubscriptionFilter::room(room_a)).await;

        dispatcher.deliver(&opt_in_event(room_b)).await;
        dispatcher.deliver(&opt_in_event(room_a)).await;

        let got = sub.events.recv().await.unwrap();
        assert_eq!(got.room_id(), room_a);
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();

        let mut first = dispatcher.subscribe(SubscriptionFilter::room(room)).await;
        let mut second = dispatcher.subscribe(SubscriptionFilter::room(room)).await;

        dispatcher.deliver(&opt_in_event(room)).await;

        assert!(first.events.recv().await.is_some());
        assert!(second.events.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();

        let mut sub = dispatcher.subscribe(SubscriptionFilter::room(room)).await;
        dispatcher.unsubscribe(sub.id).await;
        dispatcher.deliver(&opt_in_event(room)).await;

        assert!(sub.events.recv().await.is_none());
        assert_eq!(dispatcher.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();

        let sub = dispatcher.subscribe(SubscriptionFilter::room(room)).await;
        drop(sub.events);

        dispatcher.deliver(&opt_in_event(room)).await;
        assert_eq!(dispatcher.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();

        let mut sub = dispatcher
            .subscribe(SubscriptionFilter::kind(EventKind::HostExited))
            .await;

        dispatcher.deliver(&opt_in_event(room)).await;
        dispatcher
            .deliver(&ChannelEvent::HostExited { room_id: room })
            .await;

        let got = sub.events.recv().await.unwrap();
        assert_eq!(got.kind(), EventKind::HostExited);
        assert!(sub.events.try_recv().is_err());
    }
}
