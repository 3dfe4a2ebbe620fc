//! Per-slice change fan-out.
//!
//! A [`Listener`] declares callbacks for the slices it cares about. The
//! registry only calls a listener for slices it declared, so an agent update
//! never wakes a listener that only watches tests. Each callback runs under
//! `catch_unwind`; one panicking consumer does not affect the others.

use crate::state::{
    AgentPerformanceSummary, AgentRecord, AgentStatusSummary, ConnectionStats, ConnectionStatus,
    LogMap, Notification, QueueStatusSummary, Slice, StepMap, TelemetryState, TestMap,
    TestStatusSummary,
};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error};

type SliceCallback = Box<dyn Fn(&TelemetryState) + Send + Sync>;

#[derive(Default)]
pub struct Listener {
    name: Option<String>,
    callbacks: BTreeMap<Slice, SliceCallback>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("slices", &self.slices())
            .finish()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name shows up in diagnostics when a callback panics.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            callbacks: BTreeMap::new(),
        }
    }

    pub fn slices(&self) -> Vec<Slice> {
        self.callbacks.keys().copied().collect()
    }

    /// Registers a raw callback for `slice`. A second callback for the same
    /// slice replaces the first.
    pub fn on<F>(mut self, slice: Slice, callback: F) -> Self
    where
        F: Fn(&TelemetryState) + Send + Sync + 'static,
    {
        self.callbacks.insert(slice, Box::new(callback));
        self
    }

    pub fn on_connection_status<F>(self, callback: F) -> Self
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.on(Slice::ConnectionStatus, move |state| {
            callback(state.connection_status)
        })
    }

    pub fn on_last_error<F>(self, callback: F) -> Self
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.on(Slice::LastError, move |state| {
            callback(state.last_error.as_deref())
        })
    }

    pub fn on_tests<F>(self, callback: F) -> Self
    where
        F: Fn(&TestMap) + Send + Sync + 'static,
    {
        self.on(Slice::Tests, move |state| callback(&*state.tests))
    }

    pub fn on_logs<F>(self, callback: F) -> Self
    where
        F: Fn(&LogMap) + Send + Sync + 'static,
    {
        self.on(Slice::Logs, move |state| callback(&*state.logs))
    }

    pub fn on_steps<F>(self, callback: F) -> Self
    where
        F: Fn(&StepMap) + Send + Sync + 'static,
    {
        self.on(Slice::Steps, move |state| callback(&*state.steps))
    }

    pub fn on_agents<F>(self, callback: F) -> Self
    where
        F: Fn(&[AgentRecord]) + Send + Sync + 'static,
    {
        self.on(Slice::Agents, move |state| callback(state.agents.as_slice()))
    }

    pub fn on_agent_status_summary<F>(self, callback: F) -> Self
    where
        F: Fn(&AgentStatusSummary) + Send + Sync + 'static,
    {
        self.on(Slice::AgentStatusSummary, move |state| {
            callback(&*state.agent_status_summary)
        })
    }

    pub fn on_agent_performance<F>(self, callback: F) -> Self
    where
        F: Fn(&AgentPerformanceSummary) + Send + Sync + 'static,
    {
        self.on(Slice::AgentPerformance, move |state| {
            callback(&*state.agent_performance)
        })
    }

    pub fn on_queue_status<F>(self, callback: F) -> Self
    where
        F: Fn(Option<&QueueStatusSummary>) + Send + Sync + 'static,
    {
        self.on(Slice::QueueStatus, move |state| {
            callback(state.queue_status.as_deref())
        })
    }

    pub fn on_test_statuses<F>(self, callback: F) -> Self
    where
        F: Fn(Option<&TestStatusSummary>) + Send + Sync + 'static,
    {
        self.on(Slice::TestStatuses, move |state| {
            callback(state.test_statuses.as_deref())
        })
    }

    pub fn on_notifications<F>(self, callback: F) -> Self
    where
        F: Fn(&[Notification]) + Send + Sync + 'static,
    {
        self.on(Slice::Notifications, move |state| {
            callback(state.notifications.as_slice())
        })
    }

    pub fn on_stats<F>(self, callback: F) -> Self
    where
        F: Fn(&ConnectionStats) + Send + Sync + 'static,
    {
        self.on(Slice::Stats, move |state| callback(&*state.stats))
    }
}

struct Registration {
    id: u64,
    name: Option<String>,
    active: AtomicBool,
    callbacks: BTreeMap<Slice, SliceCallback>,
}

impl Registration {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn invoke(&self, slice: Slice, state: &TelemetryState) {
        let Some(callback) = self.callbacks.get(&slice) else {
            return;
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(state))) {
            error!(
                event = "subscriber_panicked",
                listener_id = self.id,
                listener = self.name.as_deref().unwrap_or("anonymous"),
                slice = %slice,
                panic = %panic_message(panic.as_ref()),
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Arc<Registration>>>,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `listener` and immediately hands it the current value of every
    /// slice it declared.
    pub fn register(self: &Arc<Self>, listener: Listener, current: &TelemetryState) -> Subscription {
        let subscription = self.reserve(listener);
        self.activate(&subscription, current);
        subscription
    }

    /// Creates the handle for `listener` without adding it to dispatch yet.
    pub fn reserve(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Subscription {
            registration: Arc::new(Registration {
                id,
                name: listener.name,
                active: AtomicBool::new(true),
                callbacks: listener.callbacks,
            }),
            registry: Arc::downgrade(self),
        }
    }

    /// Starts dispatch to a reserved subscription and delivers `current` for
    /// every slice it declared. Does nothing if it was already unsubscribed.
    pub fn activate(&self, subscription: &Subscription, current: &TelemetryState) {
        let registration = &subscription.registration;
        {
            let mut entries = self.write_entries();
            if !registration.is_active() {
                return;
            }
            entries.push(Arc::clone(registration));
        }
        debug!(
            event = "subscriber_registered",
            listener_id = registration.id,
            slices = registration.callbacks.len()
        );

        for slice in registration.callbacks.keys() {
            if !registration.is_active() {
                break;
            }
            registration.invoke(*slice, current);
        }
    }

    /// Runs every active listener interested in each changed slice.
    /// Registrations are snapshotted first so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub fn dispatch(&self, state: &TelemetryState, changed: &[Slice]) {
        if changed.is_empty() {
            return;
        }
        let entries: Vec<Arc<Registration>> = self.read_entries().clone();
        for slice in changed {
            for registration in &entries {
                if registration.is_active() {
                    registration.invoke(*slice, state);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.write_entries().retain(|registration| registration.id != id);
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Registration>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Registration>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle returned by [`SubscriberRegistry::register`]. Dropping it does not
/// unsubscribe; call [`Subscription::unsubscribe`] on any clone.
#[derive(Clone)]
pub struct Subscription {
    registration: Arc<Registration>,
    registry: Weak<SubscriberRegistry>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.registration.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    pub fn is_active(&self) -> bool {
        self.registration.is_active()
    }

    /// Stops delivery immediately, including the remainder of a dispatch
    /// already in flight. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.registration.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.registration.id);
        }
        debug!(event = "subscriber_removed", listener_id = self.registration.id);
    }
}
