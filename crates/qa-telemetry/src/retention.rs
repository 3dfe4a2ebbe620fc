use crate::config::TelemetryConfig;
use crate::event::TelemetryEvent;
use crate::state::Slice;
use crate::store::TelemetryStore;
use crate::timer::IntervalTask;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub interval: Duration,
    pub test_retention: Duration,
    pub notification_retention: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            interval: config.cleanup_interval(),
            test_retention: config.test_retention(),
            notification_retention: config.notification_retention(),
        }
    }

    pub fn prune_event(&self, now: DateTime<Utc>) -> TelemetryEvent {
        TelemetryEvent::Prune {
            now,
            test_retention: self.test_retention,
            notification_retention: self.notification_retention,
        }
    }
}

/// Periodically evicts finished tests and aged notifications. Runs whether or
/// not a transport is connected.
#[derive(Debug)]
pub struct RetentionScheduler {
    task: IntervalTask,
}

impl RetentionScheduler {
    pub fn start(store: Arc<TelemetryStore>, policy: RetentionPolicy) -> Self {
        let task = IntervalTask::spawn("retention", policy.interval, move || {
            let store = Arc::clone(&store);
            async move {
                run_cleanup(&store, &policy, Utc::now());
                true
            }
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn stop(&mut self) {
        self.task.stop();
    }
}

/// One cleanup pass. Returns the slices that changed.
pub fn run_cleanup(store: &TelemetryStore, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<Slice> {
    let changed = store.apply(&policy.prune_event(now));
    if !changed.is_empty() {
        debug!(event = "retention_pruned", slices = ?changed);
    }
    changed
}
