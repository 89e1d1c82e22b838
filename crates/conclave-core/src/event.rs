use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::traits::{EventCallback, EventSink, SubscriptionId};
use crate::types::{Event, EventKind};

/// Event bus using a tokio broadcast channel plus per-kind callbacks.
///
/// Broadcast receivers from [`EventBus::subscribe_all`] see every event;
/// callbacks registered through [`EventSink::subscribe`] only see their kind.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    callbacks: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn publish(&self, event: Event) {
        self.add_event(event);
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of callbacks registered for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.callbacks.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn add_event(&self, event: Event) {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<EventCallback> = self
            .callbacks
            .read()
            .get(&event.kind)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in callbacks {
            callback(&event);
        }

        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .entry(kind)
            .or_default()
            .push((id, callback));
        id
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let Some(subs) = callbacks.get_mut(&kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        before != subs.len()
    }
}

/// Publish to an optional sink. A missing sink drops the event.
pub fn emit(sink: &Option<Arc<dyn EventSink>>, event: Event) {
    if let Some(sink) = sink {
        sink.add_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callbacks_filtered_by_kind() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(
            EventKind::TaskCompleted,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.add_event(Event::new(EventKind::TaskCompleted));
        bus.add_event(Event::new(EventKind::TaskFailed));
        bus.add_event(Event::new(EventKind::TaskCompleted));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(
            EventKind::MessageSent,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(bus.subscriber_count(EventKind::MessageSent), 1);

        assert!(bus.unsubscribe(EventKind::MessageSent, id));
        assert!(!bus.unsubscribe(EventKind::MessageSent, id));
        bus.add_event(Event::new(EventKind::MessageSent));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broadcast_receives_all() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_all();
        bus.publish(Event::new(EventKind::NodeAdded));
        bus.publish(Event::new(EventKind::EdgeAdded));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::NodeAdded);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::EdgeAdded);
    }

    #[test]
    fn test_emit_without_sink_is_noop() {
        emit(&None, Event::new(EventKind::TaskCreated));
    }
}
