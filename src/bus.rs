//! Event bus (§4.5): one per manager, bounded buffer, fan-out dispatch.
//!
//! The dispatcher is a single task reading a `tokio::mpsc::Receiver` in arrival
//! order; each matching listener gets its own fire-and-forget delivery via
//! `rt::spawn_or_run`, so a slow or panicking listener never blocks the
//! dispatcher or its siblings.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::event::{Event, EventKind};
use crate::rt;

type Listener = Arc<dyn Fn(Event) + Send + Sync>;

struct Subscription {
    id: u64,
    filter: HashSet<EventKind>,
    listener: Listener,
}

struct Subscribers {
    entries: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Subscribers {
    fn new() -> Self {
        Subscribers {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn subscribe(&self, listener: Listener, filter: HashSet<EventKind>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push(Subscription { id, filter, listener });
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.entries.write().retain(|s| s.id != id);
    }

    fn dispatch(&self, event: Event) {
        // Copy matching listeners under lock, then deliver outside of it, so a
        // listener that calls `unsubscribe` synchronously doesn't deadlock
        // against this same lock.
        let matching: Vec<Listener> = {
            let guard = self.entries.read();
            guard
                .iter()
                .filter(|sub| sub.filter.is_empty() || sub.filter.contains(&event.kind))
                .map(|sub| sub.listener.clone())
                .collect()
        };

        for listener in matching {
            let event = event.clone();
            rt::spawn_or_run(move || listener(event));
        }
    }
}

/// Handle to the manager-wide event bus. Cloning shares the same underlying
/// queue and subscriber set.
#[derive(Clone)]
pub struct EventBus {
    /// `None` once `close()` has run. Held in a `Mutex` rather than an atomic
    /// flag because closing needs to both observe "was it already closed" and
    /// drop the one live sender atomically.
    sender: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
    subscribers: Arc<Subscribers>,
}

impl EventBus {
    /// Spawns the dispatcher task and returns a handle. `buffer` is the bounded
    /// channel capacity; `publish` drops events once it's full rather than
    /// blocking the publisher.
    pub fn new(buffer: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel(buffer.max(1));
        let subscribers = Arc::new(Subscribers::new());

        let dispatch_subscribers = subscribers.clone();
        tokio::spawn(async move {
            // Exits once every sender clone is dropped (close() drops the last
            // live one) and the buffer has been fully drained.
            while let Some(event) = receiver.recv().await {
                dispatch_subscribers.dispatch(event);
            }
        });

        EventBus {
            sender: Arc::new(Mutex::new(Some(sender))),
            subscribers,
        }
    }

    /// `filter` selects which `EventKind`s reach this listener; empty means all.
    pub fn subscribe(&self, listener: Listener, filter: HashSet<EventKind>) -> u64 {
        self.subscribers.subscribe(listener, filter)
    }

    /// Removes a subscription previously returned by `subscribe`.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.unsubscribe(id);
    }

    /// Non-blocking; silently drops the event if the buffer is full or the bus
    /// has been closed.
    pub fn publish(&self, event: Event) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(event) {
                    tracing::debug!("event bus buffer full, dropping event");
                }
            }
            None => {}
        }
    }

    /// Drops the bus's sender so the dispatcher drains whatever is already
    /// buffered and then exits; every `publish` afterward becomes a no-op.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::event::EventPayload;

    fn rejected_event(resource: &str) -> Event {
        Event::new(
            EventKind::CallRejected,
            Arc::from(resource),
            EventPayload::Rejected {
                state: crate::state_machine::State::Open,
            },
        )
    }

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.subscribe(
            Arc::new(move |_e: Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            HashSet::from([EventKind::CallFailure]),
        );

        bus.publish(rejected_event("svc"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_filter_receives_everything() {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.subscribe(
            Arc::new(move |_e: Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            HashSet::new(),
        );

        bus.publish(rejected_event("svc"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_affect_others() {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.subscribe(Arc::new(|_e: Event| panic!("boom")), HashSet::new());
        bus.subscribe(
            Arc::new(move |_e: Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            HashSet::new(),
        );

        bus.publish(rejected_event("svc"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let id = bus.subscribe(
            Arc::new(move |_e: Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            HashSet::new(),
        );
        bus.unsubscribe(id);

        bus.publish(rejected_event("svc"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_drains_buffered_events_then_discards_new_publishes() {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        bus.subscribe(
            Arc::new(move |_e: Event| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            HashSet::new(),
        );

        bus.publish(rejected_event("svc"));
        bus.close();
        bus.publish(rejected_event("svc"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
