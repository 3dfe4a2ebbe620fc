use crate::event::TelemetryEvent;
use crate::reducer::{self, ReducerOptions};
use crate::state::{Slice, TelemetryState};
use crate::subscribers::{Listener, SubscriberRegistry, Subscription};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

enum Delivery {
    Changed {
        state: Arc<TelemetryState>,
        slices: Vec<Slice>,
    },
    Activate {
        subscription: Subscription,
        state: Arc<TelemetryState>,
    },
}

#[derive(Default)]
struct DeliveryQueue {
    pending: VecDeque<Delivery>,
    draining: bool,
}

/// Owns the current [`TelemetryState`] and is the only place it is replaced.
///
/// Commits are serialized by a mutex and queued for delivery in commit order
/// while that mutex is held. Listeners run after it is released, one delivery
/// at a time: the caller that finds the queue idle drains it, and a commit
/// made while another thread (or a callback) is draining is delivered by that
/// drainer. A callback may therefore read or update the store again.
pub struct TelemetryStore {
    current: Mutex<Arc<TelemetryState>>,
    deliveries: Mutex<DeliveryQueue>,
    registry: Arc<SubscriberRegistry>,
    options: ReducerOptions,
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(ReducerOptions::default())
    }
}

impl TelemetryStore {
    pub fn new(options: ReducerOptions) -> Self {
        Self {
            current: Mutex::new(Arc::new(TelemetryState::default())),
            deliveries: Mutex::new(DeliveryQueue::default()),
            registry: SubscriberRegistry::new(),
            options,
        }
    }

    pub fn options(&self) -> &ReducerOptions {
        &self.options
    }

    pub fn snapshot(&self) -> Arc<TelemetryState> {
        Arc::clone(&*self.lock())
    }

    /// Replaces the state with `updater(current)` and notifies listeners of
    /// every slice whose identity changed. Returns those slices.
    pub fn update_state<F>(&self, updater: F) -> Vec<Slice>
    where
        F: FnOnce(&TelemetryState) -> TelemetryState,
    {
        let changed = {
            let mut current = self.lock();
            let next = updater(&**current);
            let changed = current.changed_slices(&next);
            if changed.is_empty() {
                return changed;
            }
            let next = Arc::new(next);
            *current = Arc::clone(&next);
            self.enqueue(Delivery::Changed {
                state: next,
                slices: changed.clone(),
            });
            changed
        };
        trace!(event = "state_replaced", slices = ?changed);
        self.drain();
        changed
    }

    pub fn apply(&self, event: &TelemetryEvent) -> Vec<Slice> {
        trace!(event = "telemetry_event", kind = event.name());
        let options = self.options;
        self.update_state(|state| reducer::reduce_with(state, event, &options))
    }

    /// Applies `events` as one update; listeners see the combined result once.
    pub fn apply_all(&self, events: &[TelemetryEvent]) -> Vec<Slice> {
        trace!(event = "telemetry_events", count = events.len());
        let options = self.options;
        self.update_state(|state| reducer::reduce_all(state, events, &options))
    }

    /// Applies the events normalized from one inbound message and counts it.
    pub fn apply_inbound(&self, events: &[TelemetryEvent], received_at: DateTime<Utc>) -> Vec<Slice> {
        let options = self.options;
        self.update_state(|state| {
            let next = reducer::reduce_all(state, events, &options);
            reducer::record_message_received(&next, received_at)
        })
    }

    /// Registers `listener`. It first receives the state current at this
    /// call, then every later commit exactly once.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let subscription = self.registry.reserve(listener);
        {
            let current = self.lock();
            self.enqueue(Delivery::Activate {
                subscription: subscription.clone(),
                state: Arc::clone(&*current),
            });
        }
        self.drain();
        subscription
    }

    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    fn enqueue(&self, delivery: Delivery) {
        self.lock_deliveries().pending.push_back(delivery);
    }

    fn drain(&self) {
        {
            let mut queue = self.lock_deliveries();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let delivery = {
                let mut queue = self.lock_deliveries();
                match queue.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            match delivery {
                Delivery::Changed { state, slices } => self.registry.dispatch(&state, &slices),
                Delivery::Activate {
                    subscription,
                    state,
                } => self.registry.activate(&subscription, &state),
            }
        }
    }

    fn lock_deliveries(&self) -> MutexGuard<'_, DeliveryQueue> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, Arc<TelemetryState>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentEventKind, AgentPatch, AgentUpdate, ConnectionEvent};
    use crate::state::ConnectionStatus;
    use qa_core::AgentStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// A listener that parks the delivering thread on the first
    /// `Connecting` status until released.
    fn connecting_gate(store: &TelemetryStore) -> (Subscription, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let gate = store.subscribe(Listener::named("gate").on_connection_status(move |status| {
            if status == ConnectionStatus::Connecting {
                let _ = entered_tx.lock().expect("lock").send(());
                let _ = release_rx.lock().expect("lock").recv_timeout(Duration::from_secs(5));
            }
        }));
        (gate, entered_rx, release_tx)
    }

    fn connecting_with(id: &str) -> [TelemetryEvent; 2] {
        [
            TelemetryEvent::Connection(ConnectionEvent::Connecting { at: Utc::now() }),
            test_started(id),
        ]
    }

    fn test_started(id: &str) -> TelemetryEvent {
        TelemetryEvent::TestStarted {
            test_id: id.to_string(),
            name: None,
            total_steps: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn unchanged_updates_notify_nobody() {
        let store = TelemetryStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&calls);
        let _subscription = store.subscribe(Listener::new().on(Slice::Tests, move |_| {
            handle.fetch_add(1, Ordering::SeqCst);
        }));
        let before = store.snapshot();

        let changed = store.update_state(|state| state.clone());
        assert!(changed.is_empty());
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn agent_updates_do_not_wake_test_listeners() {
        let store = TelemetryStore::default();
        let test_calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&test_calls);
        let _subscription = store.subscribe(Listener::new().on_tests(move |_| {
            handle.fetch_add(1, Ordering::SeqCst);
        }));

        let changed = store.apply(&TelemetryEvent::Agent(AgentUpdate {
            agent_id: "a1".to_string(),
            kind: AgentEventKind::Status,
            patch: AgentPatch {
                status: Some(AgentStatus::Busy),
                ..AgentPatch::default()
            },
            at: Utc::now(),
        }));
        assert!(changed.contains(&Slice::Agents));
        assert!(!changed.contains(&Slice::Tests));
        assert_eq!(test_calls.load(Ordering::SeqCst), 1);

        store.apply(&test_started("t1"));
        assert_eq!(test_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_notifies_once() {
        let store = TelemetryStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&calls);
        let _subscription = store.subscribe(Listener::new().on_tests(move |_| {
            handle.fetch_add(1, Ordering::SeqCst);
        }));

        store.apply_inbound(&[test_started("t1"), test_started("t2")], Utc::now());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.snapshot().tests.len(), 2);
        assert_eq!(store.snapshot().stats.messages_received, 1);
    }

    #[test]
    fn listeners_can_reenter_the_store() {
        let store = Arc::new(TelemetryStore::default());
        let observed = Arc::new(AtomicUsize::new(0));
        let inner_store = Arc::clone(&store);
        let inner_observed = Arc::clone(&observed);
        let _subscription = store.subscribe(Listener::new().on_tests(move |tests| {
            let snapshot = inner_store.snapshot();
            assert_eq!(snapshot.tests.len(), tests.len());
            inner_observed.store(tests.len(), Ordering::SeqCst);
        }));

        store.apply(&test_started("t1"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_writers_are_delivered_in_commit_order() {
        let store = Arc::new(TelemetryStore::default());
        let (_gate, entered, release) = connecting_gate(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _tests = store.subscribe(Listener::named("tests").on_tests(move |tests| {
            sink.lock().expect("lock").push(tests.len());
        }));

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.apply_all(&connecting_with("t1")))
        };
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("writer reached the gate");

        // Committed while the first writer is still delivering.
        let changed = store.apply(&test_started("t2"));
        assert!(changed.contains(&Slice::Tests));
        release.send(()).expect("release gate");
        writer.join().expect("writer thread");

        assert_eq!(store.snapshot().tests.len(), 2);
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[test]
    fn subscribing_during_a_delivery_sees_each_commit_once() {
        let store = Arc::new(TelemetryStore::default());
        let (_gate, entered, release) = connecting_gate(&store);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.apply_all(&connecting_with("t1")))
        };
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("writer reached the gate");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let late = store.subscribe(Listener::named("late").on_tests(move |tests| {
            sink.lock().expect("lock").push(tests.len());
        }));
        assert!(late.is_active());
        release.send(()).expect("release gate");
        writer.join().expect("writer thread");
        assert_eq!(store.listener_count(), 2);
        assert_eq!(*seen.lock().expect("lock"), vec![1]);

        store.apply(&test_started("t2"));
        assert_eq!(*seen.lock().expect("lock"), vec![1, 2]);
    }

    #[test]
    fn writes_from_a_callback_follow_the_current_delivery() {
        let store = Arc::new(TelemetryStore::new(ReducerOptions {
            max_notifications: 7,
        }));
        assert_eq!(store.options().max_notifications, 7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let inner = Arc::clone(&store);
        let _chain = store.subscribe(Listener::new().on_tests(move |tests| {
            sink.lock().expect("lock").push(tests.len());
            if tests.len() == 1 {
                inner.apply(&test_started("t2"));
            }
        }));

        store.apply(&test_started("t1"));
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2]);
    }
}
