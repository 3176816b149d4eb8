//! Single-dispatcher event bus for counters, progress and abort signals.
//!
//! [`EventBus::publish`] queues an event for the background dispatch thread.
//! [`EventBus::publish_sync`] skips the queue and delivers inline while holding
//! the dispatch lock, so every live subscriber has reacted before it returns.
//! Aborts always take the synchronous path.
//!
//! Subscriptions are explicit handles: dropping a [`Subscription`] removes its
//! handler.

use crate::models::TypeTag;
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Units taken off the input queue and processed
    Units,
    /// Objects released to the output writer
    Written,
    /// Units excluded by the tiling filter or producing no output
    Filtered,
    /// Units that failed with a recoverable error
    Failed,
    Deferred,
    Resolved,
    /// Deferred references dropped because they could not be resolved
    Skipped,
    Geometries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Counter,
    ObjectCount,
    Status,
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Counter { kind: CounterKind, delta: u64 },
    ObjectCount { type_tag: TypeTag, count: u64 },
    Status(String),
    /// The run cannot continue. `unit` describes the unit being processed,
    /// if any.
    Abort { cause: String, unit: Option<String> },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Counter { .. } => EventType::Counter,
            Event::ObjectCount { .. } => EventType::ObjectCount,
            Event::Status(_) => EventType::Status,
            Event::Abort { .. } => EventType::Abort,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    event_type: EventType,
    handler: Handler,
    auto_remove: bool,
}

struct Registry {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    /// Held for the whole delivery of one event.
    dispatch: Mutex<()>,
}

impl Registry {
    fn deliver(&self, event: &Event) {
        let _guard = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let event_type = event.event_type();

        let mut targets: Vec<(u64, Handler, bool)> = self
            .subscribers
            .iter()
            .filter(|s| s.event_type == event_type)
            .map(|s| (*s.key(), Arc::clone(&s.handler), s.auto_remove))
            .collect();
        targets.sort_unstable_by_key(|(id, _, _)| *id);

        for (id, handler, auto_remove) in targets {
            // Unsubscribed while we were collecting.
            if auto_remove {
                if self.subscribers.remove(&id).is_none() {
                    continue;
                }
            } else if !self.subscribers.contains_key(&id) {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(subscriber = id, ?event_type, "Event handler panicked");
            }
        }
    }
}

/// Keeps a handler registered until dropped.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.remove(&self.id);
        }
    }
}

pub struct EventBus {
    registry: Arc<Registry>,
    sender: Mutex<Option<Sender<Event>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let registry = Arc::new(Registry {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            dispatch: Mutex::new(()),
        });
        let (sender, receiver) = bounded(capacity.max(1));
        let dispatcher = {
            let registry = Arc::clone(&registry);
            thread::Builder::new()
                .name("citypipe-events".to_string())
                .spawn(move || dispatch_loop(&registry, &receiver))
                .map_err(|e| error!(error = %e, "Failed to spawn event dispatcher"))
                .ok()
        };
        Self {
            registry,
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(dispatcher),
        }
    }

    pub fn subscribe<F>(&self, event_type: EventType, handler: F, auto_remove: bool) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.subscribers.insert(
            id,
            Subscriber {
                event_type,
                handler: Arc::new(handler),
                auto_remove,
            },
        );
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }

    /// Queues an event for asynchronous delivery.
    ///
    /// Blocks while the queue is full. Once the bus is shut down, or if the
    /// dispatcher could not be started, the event is delivered inline instead.
    pub fn publish(&self, event: Event) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let has_dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        match sender {
            Some(sender) if has_dispatcher => {
                if let Err(e) = sender.send(event) {
                    self.registry.deliver(&e.into_inner());
                }
            }
            _ => self.registry.deliver(&event),
        }
    }

    /// Delivers an event to every current subscriber before returning.
    pub fn publish_sync(&self, event: Event) {
        self.registry.deliver(&event);
    }

    /// Stops accepting queued events, delivers everything already queued and
    /// joins the dispatcher. Idempotent.
    pub fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Event dispatcher thread panicked");
            }
            debug!("Event bus shut down");
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(registry: &Registry, receiver: &Receiver<Event>) {
    for event in receiver.iter() {
        registry.deliver(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn counter_event(delta: u64) -> Event {
        Event::Counter {
            kind: CounterKind::Units,
            delta,
        }
    }

    #[test]
    fn async_publish_reaches_subscriber_before_shutdown_returns() {
        let bus = EventBus::new(16);
        let total = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&total);
        let _sub = bus.subscribe(
            EventType::Counter,
            move |event| {
                if let Event::Counter { delta, .. } = event {
                    seen.fetch_add(*delta, Ordering::SeqCst);
                }
            },
            false,
        );

        for i in 1..=100 {
            bus.publish(counter_event(i));
        }
        bus.shutdown();
        assert_eq!(total.load(Ordering::SeqCst), 5050);
    }

    #[test]
    fn sync_publish_is_observed_by_every_subscriber_before_returning() {
        let bus = EventBus::new(16);
        let observed = Arc::new(AtomicUsize::new(0));
        let subs: Vec<Subscription> = (0..8)
            .map(|_| {
                let observed = Arc::clone(&observed);
                bus.subscribe(
                    EventType::Abort,
                    move |_| {
                        observed.fetch_add(1, Ordering::SeqCst);
                    },
                    false,
                )
            })
            .collect();

        bus.publish_sync(Event::Abort {
            cause: "connection lost".to_string(),
            unit: None,
        });
        assert_eq!(observed.load(Ordering::SeqCst), 8);
        drop(subs);
    }

    #[test]
    fn handlers_only_see_their_event_type() {
        let bus = EventBus::new(16);
        let aborts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&aborts);
        let _sub = bus.subscribe(
            EventType::Abort,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        bus.publish_sync(counter_event(1));
        bus.publish_sync(Event::Status("tiling".to_string()));
        assert_eq!(aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn auto_remove_fires_once() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _sub = bus.subscribe(
            EventType::Status,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        bus.publish_sync(Event::Status("a".to_string()));
        bus.publish_sync(Event::Status("b".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let sub = bus.subscribe(
            EventType::Status,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish_sync(Event::Status("ignored".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _bad = bus.subscribe(EventType::Status, |_| panic!("boom"), false);
        let _good = bus.subscribe(
            EventType::Status,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        bus.publish(Event::Status("x".to_string()));
        bus.publish_sync(Event::Status("y".to_string()));
        bus.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn publish_after_shutdown_delivers_inline() {
        let bus = EventBus::new(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _sub = bus.subscribe(
            EventType::Status,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        bus.shutdown();
        bus.shutdown();
        bus.publish(Event::Status("late".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_publishers() {
        let bus = Arc::new(EventBus::new(4));
        let total = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&total);
        let _sub = bus.subscribe(
            EventType::Counter,
            move |event| {
                if let Event::Counter { delta, .. } = event {
                    seen.fetch_add(*delta, Ordering::SeqCst);
                }
            },
            false,
        );

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bus = Arc::clone(&bus);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..250 {
                        bus.publish(counter_event(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        bus.shutdown();
        assert_eq!(total.load(Ordering::SeqCst), 1000);
    }
}
