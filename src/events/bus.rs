//! In-process typed pub/sub with per-room subscribers and bounded queues.
//!
//! Publish never blocks the caller: when a subscriber's queue is full the
//! bus drops the oldest queued event for that subscriber, emits a single
//! `system.backpressure` event on the global room (at most one per
//! subscriber per overflow interval), and the publish still succeeds.

use dashmap::DashMap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::types::{Event, EventKind, Room};

/// Default per-subscriber buffer size.
pub const DEFAULT_BUFFER: usize = 256;

/// Minimum spacing between backpressure events for one subscriber.
const BACKPRESSURE_INTERVAL: Duration = Duration::from_secs(1);

struct SubscriberQueue {
    queue: VecDeque<Event>,
    last_backpressure: Option<Instant>,
}

struct Subscriber {
    id: u64,
    label: String,
    capacity: usize,
    inner: Mutex<SubscriberQueue>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Subscriber {
    fn push(&self, event: Event) -> Option<u64> {
        let mut inner = self.inner.lock().expect("subscriber queue poisoned");
        inner.queue.push_back(event);

        let mut overflow_report = None;
        if inner.queue.len() > self.capacity {
            inner.queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;

            let due = inner
                .last_backpressure
                .map(|t| t.elapsed() >= BACKPRESSURE_INTERVAL)
                .unwrap_or(true);
            if due {
                inner.last_backpressure = Some(Instant::now());
                overflow_report = Some(dropped);
            }
        }
        drop(inner);

        self.notify.notify_one();
        overflow_report
    }

    fn pop(&self) -> Option<Event> {
        self.inner
            .lock()
            .expect("subscriber queue poisoned")
            .queue
            .pop_front()
    }
}

/// Typed, room-scoped event bus.
///
/// Created once at startup and passed explicitly into every component.
pub struct EventBus {
    rooms: DashMap<Room, Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    seq: AtomicU64,
    dropped_total: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Publish an event to every room it targets.
    ///
    /// Synchronous and non-blocking: queue maintenance happens under short
    /// per-subscriber locks and slow consumers only ever lose their own
    /// oldest events.
    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ..Event::new(kind)
        };
        for room in event.kind.rooms() {
            self.deliver(&room, &event);
        }
    }

    fn deliver(&self, room: &Room, event: &Event) {
        let subscribers: Vec<Arc<Subscriber>> = match self.rooms.get(room) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        let mut lagging: Vec<(String, u64)> = Vec::new();
        for sub in &subscribers {
            if sub.closed.load(Ordering::Relaxed) {
                continue;
            }
            if let Some(dropped) = sub.push(event.clone()) {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                lagging.push((sub.label.clone(), dropped));
            }
        }

        // Overflow of the backpressure signal itself is not re-reported.
        if matches!(event.kind, EventKind::SystemBackpressure { .. }) {
            return;
        }
        for (label, dropped) in lagging {
            warn!(
                "event bus backpressure: subscriber={} room={} dropped={}",
                label, room, dropped
            );
            self.publish(EventKind::SystemBackpressure {
                subscriber: label,
                room: room.to_string(),
                dropped,
            });
        }
    }

    /// Join a room with the given buffer size.
    pub fn subscribe(self: &Arc<Self>, room: Room, label: &str, buffer: usize) -> Subscription {
        let sub = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            capacity: buffer.max(1),
            inner: Mutex::new(SubscriberQueue {
                queue: VecDeque::new(),
                last_backpressure: None,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        self.rooms.entry(room.clone()).or_default().push(sub.clone());
        debug!("subscriber {} joined {}", label, room);

        Subscription {
            bus: self.clone(),
            room,
            sub,
        }
    }

    /// Join a room with the default buffer size.
    pub fn subscribe_default(self: &Arc<Self>, room: Room, label: &str) -> Subscription {
        self.subscribe(room, label, DEFAULT_BUFFER)
    }

    /// Total events dropped across all subscribers since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    fn remove(&self, room: &Room, id: u64) {
        if let Some(mut entry) = self.rooms.get_mut(room) {
            entry.value_mut().retain(|s| s.id != id);
        }
        self.rooms.retain(|_, subs| !subs.is_empty());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one room. Dropping it releases all resources;
/// queued events are discarded.
pub struct Subscription {
    bus: Arc<EventBus>,
    room: Room,
    sub: Arc<Subscriber>,
}

impl Subscription {
    /// Receive the next event, in publish order for this room.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.sub.pop() {
                return event;
            }
            self.sub.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.sub.pop()
    }

    /// Number of events this subscriber has lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.sub.dropped.load(Ordering::Relaxed)
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.sub
            .inner
            .lock()
            .expect("subscriber queue poisoned")
            .queue
            .len()
    }

    pub fn room(&self) -> &Room {
        &self.room
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.sub.closed.store(true, Ordering::Relaxed);
        self.sub
            .inner
            .lock()
            .expect("subscriber queue poisoned")
            .queue
            .clear();
        self.bus.remove(&self.room, self.sub.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn terminal_data(session: &str, n: usize) -> EventKind {
        EventKind::TerminalData {
            session_id: session.to_string(),
            data: format!("chunk-{n}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_default(Room::Session("s1".into()), "test");

        for n in 0..10 {
            bus.publish(terminal_data("s1", n));
        }

        for n in 0..10 {
            let ev = sub.recv().await;
            match ev.kind {
                EventKind::TerminalData { data, .. } => {
                    assert_eq!(data, format!("chunk-{n}"))
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let bus = Arc::new(EventBus::new());
        let s1 = bus.subscribe_default(Room::Session("s1".into()), "one");
        let s2 = bus.subscribe_default(Room::Session("s2".into()), "two");

        bus.publish(terminal_data("s1", 0));

        assert!(s1.try_recv().is_some());
        assert!(s2.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_signals_once() {
        let bus = Arc::new(EventBus::new());
        // A subscriber that never reads, with a tiny buffer.
        let slow = bus.subscribe(Room::Session("s1".into()), "slow", 4);
        let global = bus.subscribe_default(Room::Global, "watcher");

        let started = StdInstant::now();
        for n in 0..100 {
            bus.publish(terminal_data("s1", n));
        }
        // Publisher never blocked anywhere near the soft deadline.
        assert!(started.elapsed() < Duration::from_millis(50));

        assert_eq!(slow.depth(), 4);
        assert_eq!(slow.dropped(), 96);
        // Oldest were dropped: head of the queue is chunk-96.
        match slow.try_recv().unwrap().kind {
            EventKind::TerminalData { data, .. } => assert_eq!(data, "chunk-96"),
            other => panic!("unexpected event: {other:?}"),
        }

        // Exactly one backpressure event within the overflow interval.
        let mut backpressure = 0;
        while let Some(ev) = global.try_recv() {
            if let EventKind::SystemBackpressure {
                subscriber, room, ..
            } = ev.kind
            {
                assert_eq!(subscriber, "slow");
                assert_eq!(room, "session:s1");
                backpressure += 1;
            }
        }
        assert_eq!(backpressure, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let bus = Arc::new(EventBus::new());
        let _slow = bus.subscribe(Room::Session("s1".into()), "slow", 2);
        let fast = bus.subscribe(Room::Session("s1".into()), "fast", 256);

        for n in 0..50 {
            bus.publish(terminal_data("s1", n));
        }

        let mut seen = 0;
        while fast.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 50);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_room() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_default(Room::Session("s1".into()), "gone");
        bus.publish(terminal_data("s1", 0));
        drop(sub);

        // Publishing after the drop must not panic or accumulate.
        bus.publish(terminal_data("s1", 1));
        assert!(bus.rooms.get(&Room::Session("s1".into())).is_none());
    }

    #[tokio::test]
    async fn seq_is_monotonic_within_room() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_default(Room::Session("s1".into()), "seq");

        for n in 0..5 {
            bus.publish(terminal_data("s1", n));
        }
        let mut last = 0;
        for _ in 0..5 {
            let ev = sub.recv().await;
            assert!(ev.seq > last);
            last = ev.seq;
        }
    }
}
