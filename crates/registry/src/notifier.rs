use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::event::{NetworkEvent, NetworkListener};

/// Handle returned by [`EventNotifier::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, Arc<dyn NetworkListener>)>;

/// Fan-out hub for network events.
///
/// Events are queued and delivered on a dedicated dispatch task, so a slow
/// listener never blocks the mutation path that produced the event. Each
/// delivery is isolated: a listener that panics is logged and skipped
/// without affecting delivery to the others. The dispatch task iterates
/// over a snapshot of the listener list, which makes subscribing or
/// unsubscribing from inside a callback safe.
#[derive(Clone)]
pub struct EventNotifier {
    listeners: Arc<RwLock<ListenerList>>,
    next_id: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<NetworkEvent>,
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read().map_or(0, |list| list.len());

        f.debug_struct("EventNotifier")
            .field("listeners", &listeners)
            .finish_non_exhaustive()
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    /// Creates a new `EventNotifier` and starts its dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let listeners: Arc<RwLock<ListenerList>> = Arc::new(RwLock::new(Vec::new()));
        let (queue, mut events) = mpsc::unbounded_channel::<NetworkEvent>();

        {
            let listeners = listeners.clone();

            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let snapshot = match listeners.read() {
                        Ok(list) => list.clone(),
                        Err(_) => {
                            warn!("listener registry poisoned, stopping dispatch");
                            break;
                        }
                    };

                    for (id, listener) in snapshot {
                        // Delivery to each listener is independent; one
                        // unwinding must not starve the rest.
                        let event = event.clone();
                        let outcome =
                            catch_unwind(AssertUnwindSafe(move || listener.deliver(event)));

                        if outcome.is_err() {
                            warn!(?id, "listener panicked during delivery");
                        }
                    }
                }
            });
        }

        Self {
            listeners,
            next_id: Arc::new(AtomicU64::new(0)),
            queue,
        }
    }

    /// Registers a listener. Events published after this call will be
    /// delivered to it in arrival order.
    pub fn subscribe(&self, listener: Arc<dyn NetworkListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if let Ok(mut list) = self.listeners.write() {
            list.push((id, listener));
        }

        id
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let Ok(mut list) = self.listeners.write() else {
            return false;
        };

        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        before != list.len()
    }

    /// Enqueues an event for delivery. Never blocks.
    pub fn publish(&self, event: NetworkEvent) {
        // The dispatch task only stops when the notifier is dropped.
        let _ = self.queue.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use netmesh_store::Version;

    use crate::event::NetworkEventKind;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl NetworkListener for Recorder {
        fn deliver(&self, event: NetworkEvent) {
            self.seen.lock().unwrap().push(event.network);
        }
    }

    fn event(network: &str) -> NetworkEvent {
        NetworkEvent {
            kind: NetworkEventKind::Updated,
            network: network.to_string(),
            version: Version::new(1),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let notifier = EventNotifier::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        notifier.subscribe(recorder.clone());

        notifier.publish(event("one"));
        notifier.publish(event("two"));
        notifier.publish(event("three"));
        settle().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let notifier = EventNotifier::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let id = notifier.subscribe(recorder.clone());

        notifier.publish(event("one"));
        settle().await;

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));

        notifier.publish(event("two"));
        settle().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["one"]);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_halt_delivery() {
        struct Exploding;

        impl NetworkListener for Exploding {
            fn deliver(&self, _event: NetworkEvent) {
                panic!("listener failure");
            }
        }

        let notifier = EventNotifier::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        notifier.subscribe(Arc::new(Exploding));
        notifier.subscribe(recorder.clone());

        notifier.publish(event("one"));
        notifier.publish(event("two"));
        settle().await;

        // The recorder sits behind the panicking listener and must still
        // see every event.
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_subscribe_from_inside_a_callback() {
        struct Chaining {
            notifier: EventNotifier,
            tail: Arc<Recorder>,
            done: Mutex<bool>,
        }

        impl NetworkListener for Chaining {
            fn deliver(&self, _event: NetworkEvent) {
                let mut done = self.done.lock().unwrap();
                if !*done {
                    self.notifier.subscribe(self.tail.clone());
                    *done = true;
                }
            }
        }

        let notifier = EventNotifier::new();
        let tail = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        notifier.subscribe(Arc::new(Chaining {
            notifier: notifier.clone(),
            tail: tail.clone(),
            done: Mutex::new(false),
        }));

        notifier.publish(event("first"));
        settle().await;
        notifier.publish(event("second"));
        settle().await;

        // The tail listener was registered during delivery of the first
        // event and must only see the second.
        assert_eq!(*tail.seen.lock().unwrap(), vec!["second"]);
    }
}
