//! Pure state transitions.
//!
//! `reduce` never mutates its input. Slices an event does not touch are
//! carried over by `Arc` clone, so the store's pointer comparison reports
//! exactly the slices that were rebuilt.

use crate::event::{
    AgentEventKind, AgentPatch, AgentUpdate, ConnectionEvent, EventOrigin, StepPhase,
    TelemetryEvent, TestOutcome,
};
use crate::state::{
    AgentRecord, ConnectionStats, ConnectionStatus, HealthCheck, Notification, NotificationKind,
    TelemetryState, TestLogEntry, TestRecord, TestStepSnapshot,
};
use crate::summary::{agent_performance_summary, agent_status_summary};
use chrono::{DateTime, Utc};
use qa_core::{AgentStatus, LogLevel, TestStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MAX_NOTIFICATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReducerOptions {
    /// Oldest notifications are dropped beyond this count.
    pub max_notifications: usize,
}

impl Default for ReducerOptions {
    fn default() -> Self {
        Self {
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
        }
    }
}

pub fn reduce(state: &TelemetryState, event: &TelemetryEvent) -> TelemetryState {
    reduce_with(state, event, &ReducerOptions::default())
}

pub fn reduce_with(
    state: &TelemetryState,
    event: &TelemetryEvent,
    options: &ReducerOptions,
) -> TelemetryState {
    match event {
        TelemetryEvent::Connection(event) => reduce_connection(state, event, options),
        TelemetryEvent::TestStarted {
            test_id,
            name,
            total_steps,
            at,
        } => test_started(state, test_id, name.as_deref(), *total_steps, *at),
        TelemetryEvent::TestLog {
            test_id,
            level,
            message,
            name,
            at,
        } => test_log(state, test_id, *level, message, name.as_deref(), *at),
        TelemetryEvent::Step {
            test_id,
            phase,
            step_number,
            total_steps,
            description,
            origin,
            at,
        } => step_progress(
            state,
            test_id,
            *phase,
            *step_number,
            *total_steps,
            description.as_deref(),
            *origin,
            *at,
        ),
        TelemetryEvent::TestFinished {
            test_id,
            outcome,
            error,
            origin,
            at,
        } => test_finished(state, test_id, *outcome, error.as_deref(), *origin, *at),
        TelemetryEvent::Agent(update) => agent_update(state, update, options),
        TelemetryEvent::QueueStatus(summary) => TelemetryState {
            queue_status: Some(Arc::new(summary.clone())),
            ..state.clone()
        },
        TelemetryEvent::TestStatuses(summary) => TelemetryState {
            test_statuses: Some(Arc::new(summary.clone())),
            ..state.clone()
        },
        TelemetryEvent::LatencyMeasured { latency_ms } => with_stats(state, |stats| {
            stats.latency_ms = Some(*latency_ms);
        }),
        TelemetryEvent::Prune {
            now,
            test_retention,
            notification_retention,
        } => prune(state, *now, *test_retention, *notification_retention),
        TelemetryEvent::ClearTestLogs { test_id } => clear_test_logs(state, test_id),
        TelemetryEvent::ClearAll => clear_all(state),
    }
}

/// Folds a batch of events left to right.
pub fn reduce_all<'a>(
    state: &TelemetryState,
    events: impl IntoIterator<Item = &'a TelemetryEvent>,
    options: &ReducerOptions,
) -> TelemetryState {
    events
        .into_iter()
        .fold(state.clone(), |acc, event| reduce_with(&acc, event, options))
}

/// Counts one successfully normalized inbound message.
pub fn record_message_received(state: &TelemetryState, at: DateTime<Utc>) -> TelemetryState {
    with_stats(state, |stats| {
        stats.messages_received += 1;
        stats.last_message_time = Some(at);
    })
}

fn with_stats(state: &TelemetryState, edit: impl FnOnce(&mut ConnectionStats)) -> TelemetryState {
    let mut stats = (*state.stats).clone();
    edit(&mut stats);
    TelemetryState {
        stats: Arc::new(stats),
        ..state.clone()
    }
}

fn push_notification(
    next: &mut TelemetryState,
    notification: Notification,
    options: &ReducerOptions,
) {
    let mut notifications = (*next.notifications).clone();
    notifications.push(notification);
    if notifications.len() > options.max_notifications {
        let excess = notifications.len() - options.max_notifications;
        notifications.drain(..excess);
    }
    next.notifications = Arc::new(notifications);
}

fn append_log(next: &mut TelemetryState, test_id: &str, entry: TestLogEntry) {
    let mut logs = (*next.logs).clone();
    logs.entry(test_id.to_string()).or_default().push(entry);
    next.logs = Arc::new(logs);
}

fn put_test(next: &mut TelemetryState, record: TestRecord) {
    let mut tests = (*next.tests).clone();
    tests.insert(record.id.clone(), record);
    next.tests = Arc::new(tests);
}

fn inferred_test(test_id: &str, name: Option<&str>, at: DateTime<Utc>) -> TestRecord {
    TestRecord {
        id: test_id.to_string(),
        name: name.unwrap_or(test_id).to_string(),
        status: TestStatus::Running,
        start_time: at,
        end_time: None,
        current_step: 0,
        total_steps: 0,
        error: None,
    }
}

fn test_started(
    state: &TelemetryState,
    test_id: &str,
    name: Option<&str>,
    total_steps: Option<u32>,
    at: DateTime<Utc>,
) -> TelemetryState {
    if state.tests.contains_key(test_id) {
        debug!(event = "duplicate_test_started", test_id);
        return state.clone();
    }
    let record = TestRecord {
        total_steps: total_steps.unwrap_or(0),
        ..inferred_test(test_id, name, at)
    };
    let message = format!("Test started: {}", record.name);
    let mut next = state.clone();
    put_test(&mut next, record);
    append_log(
        &mut next,
        test_id,
        TestLogEntry {
            level: LogLevel::Info,
            message,
            timestamp: at,
        },
    );
    next
}

fn test_log(
    state: &TelemetryState,
    test_id: &str,
    level: LogLevel,
    message: &str,
    name: Option<&str>,
    at: DateTime<Utc>,
) -> TelemetryState {
    let mut next = state.clone();
    if !state.tests.contains_key(test_id) {
        debug!(event = "test_inferred_from_log", test_id);
        put_test(&mut next, inferred_test(test_id, name, at));
    }
    append_log(
        &mut next,
        test_id,
        TestLogEntry {
            level,
            message: message.to_string(),
            timestamp: at,
        },
    );
    next
}

#[allow(clippy::too_many_arguments)]
fn step_progress(
    state: &TelemetryState,
    test_id: &str,
    phase: StepPhase,
    step_number: u32,
    total_steps: Option<u32>,
    description: Option<&str>,
    origin: EventOrigin,
    at: DateTime<Utc>,
) -> TelemetryState {
    let mut record = match state.tests.get(test_id) {
        Some(record) if record.status.is_terminal() => {
            debug!(event = "step_after_terminal", test_id, step_number);
            return state.clone();
        }
        Some(record) => record.clone(),
        None => {
            debug!(event = "test_inferred_from_step", test_id);
            inferred_test(test_id, None, at)
        }
    };

    record.current_step = step_number;
    record.total_steps = total_steps.unwrap_or(record.total_steps).max(step_number);
    let snapshot = TestStepSnapshot {
        current: step_number,
        total: record.total_steps,
        description: description.map(str::to_string),
    };

    let mut next = state.clone();
    if origin == EventOrigin::Wire {
        let mut message = format!(
            "Step {}/{} {}",
            step_number,
            record.total_steps,
            phase.as_str()
        );
        if let Some(description) = description {
            message.push_str(": ");
            message.push_str(description);
        }
        append_log(
            &mut next,
            test_id,
            TestLogEntry {
                level: LogLevel::Info,
                message,
                timestamp: at,
            },
        );
    }
    put_test(&mut next, record);
    let mut steps = (*next.steps).clone();
    steps.insert(test_id.to_string(), snapshot);
    next.steps = Arc::new(steps);
    next
}

fn test_finished(
    state: &TelemetryState,
    test_id: &str,
    outcome: TestOutcome,
    error: Option<&str>,
    origin: EventOrigin,
    at: DateTime<Utc>,
) -> TelemetryState {
    let Some(existing) = state.tests.get(test_id) else {
        debug!(event = "terminal_for_unknown_test", test_id, outcome = ?outcome);
        return state.clone();
    };
    if existing.status.is_terminal() {
        debug!(event = "terminal_after_terminal", test_id, status = %existing.status);
        return state.clone();
    }

    let mut record = existing.clone();
    record.status = outcome.status();
    record.end_time = Some(at);
    if outcome != TestOutcome::Completed {
        record.error = error.map(str::to_string);
    }

    let mut next = state.clone();
    if origin == EventOrigin::Wire {
        let (level, mut message) = match outcome {
            TestOutcome::Completed => (LogLevel::Info, "Test completed".to_string()),
            TestOutcome::Failed => (LogLevel::Error, "Test failed".to_string()),
            TestOutcome::Aborted => (LogLevel::Warning, "Test aborted".to_string()),
        };
        if let Some(reason) = record.error.as_deref() {
            message.push_str(": ");
            message.push_str(reason);
        }
        append_log(
            &mut next,
            test_id,
            TestLogEntry {
                level,
                message,
                timestamp: at,
            },
        );
    }
    put_test(&mut next, record);
    next
}

fn apply_patch(record: &mut AgentRecord, patch: &AgentPatch, at: DateTime<Utc>) {
    if let Some(name) = &patch.name {
        record.name = name.clone();
    }
    if let Some(status) = patch.status {
        record.status = status;
        if status != AgentStatus::Error {
            record.error = None;
        }
    }
    if let Some(agent_type) = &patch.agent_type {
        record.agent_type = Some(agent_type.clone());
    }
    if let Some(browser) = &patch.browser {
        record.browser = Some(browser.clone());
    }
    if let Some(ip) = &patch.ip {
        record.ip = Some(ip.clone());
    }
    if let Some(version) = &patch.version {
        record.version = Some(version.clone());
    }
    if let Some(capabilities) = &patch.capabilities {
        record.capabilities = Some(capabilities.clone());
    }
    if let Some(resources) = &patch.resources {
        record.resources = Some(match &record.resources {
            Some(previous) => previous.merged(resources),
            None => resources.clone(),
        });
    }
    if let Some(status) = &patch.health_status {
        record.health_check = Some(HealthCheck {
            status: status.clone(),
            message: patch.health_message.clone(),
            checked_at: at,
        });
    }
    if let Some(error) = &patch.error {
        record.error = Some(error.clone());
    }
    record.last_seen = at;
}

fn agent_update(
    state: &TelemetryState,
    update: &AgentUpdate,
    options: &ReducerOptions,
) -> TelemetryState {
    let mut agents = (*state.agents).clone();
    let position = agents.iter().position(|agent| agent.id == update.agent_id);
    let inserted = position.is_none();
    let index = match position {
        Some(index) => index,
        None => {
            agents.push(AgentRecord::first_seen(&update.agent_id, update.at));
            agents.len() - 1
        }
    };
    apply_patch(&mut agents[index], &update.patch, update.at);
    let agent_name = agents[index].name.clone();
    let agent_error = agents[index].error.clone();

    let status_affecting = match update.kind {
        AgentEventKind::Status
        | AgentEventKind::Health
        | AgentEventKind::Crashed
        | AgentEventKind::StateChanged => true,
        AgentEventKind::Details => update.patch.status.is_some(),
        AgentEventKind::Performance => false,
    };
    let performance_affecting =
        update.kind == AgentEventKind::Performance || update.patch.resources.is_some();

    let mut next = TelemetryState {
        agents: Arc::new(agents),
        ..state.clone()
    };
    if inserted || status_affecting {
        next.agent_status_summary = Arc::new(agent_status_summary(&next.agents));
    }
    if performance_affecting {
        next.agent_performance = Arc::new(agent_performance_summary(&next.agents));
    }
    if update.kind == AgentEventKind::Crashed {
        let reason = agent_error.unwrap_or_else(|| "agent crashed".to_string());
        push_notification(
            &mut next,
            Notification::new(
                NotificationKind::Error,
                format!("Agent {agent_name} crashed: {reason}"),
                update.at,
            ),
            options,
        );
    }
    next
}

fn reduce_connection(
    state: &TelemetryState,
    event: &ConnectionEvent,
    options: &ReducerOptions,
) -> TelemetryState {
    let mut next = state.clone();
    match event {
        ConnectionEvent::Connecting { .. } => {
            next.connection_status = ConnectionStatus::Connecting;
        }
        ConnectionEvent::Connected { at, reconnect } => {
            next.connection_status = ConnectionStatus::Connected;
            next.last_error = None;
            next = with_stats(&next, |stats| {
                stats.connected_since = Some(*at);
                if *reconnect {
                    stats.reconnect_count += 1;
                }
            });
            let message = if *reconnect {
                "Reconnected to telemetry stream"
            } else {
                "Connected to telemetry stream"
            };
            push_notification(
                &mut next,
                Notification::new(NotificationKind::Success, message, *at),
                options,
            );
        }
        ConnectionEvent::Disconnected { reason, at } => {
            next.connection_status = ConnectionStatus::Disconnected;
            if state.stats.connected_since.is_some() {
                next = with_stats(&next, |stats| stats.connected_since = None);
            }
            push_notification(
                &mut next,
                Notification::new(
                    NotificationKind::Warning,
                    format!("Disconnected from telemetry stream: {reason}"),
                    *at,
                ),
                options,
            );
        }
        ConnectionEvent::Failed { message, at } => {
            next.connection_status = ConnectionStatus::Error;
            next.last_error = Some(message.clone());
            if state.stats.connected_since.is_some() {
                next = with_stats(&next, |stats| stats.connected_since = None);
            }
            push_notification(
                &mut next,
                Notification::new(
                    NotificationKind::Error,
                    format!("Connection failed: {message}"),
                    *at,
                ),
                options,
            );
        }
        ConnectionEvent::ReconnectExhausted { attempts, at } => {
            next.connection_status = ConnectionStatus::Error;
            push_notification(
                &mut next,
                Notification::new(
                    NotificationKind::Error,
                    format!("Gave up reconnecting after {attempts} attempts"),
                    *at,
                ),
                options,
            );
        }
    }
    next
}

fn older_than(now: DateTime<Utc>, then: DateTime<Utc>, window: Duration) -> bool {
    (now - then)
        .to_std()
        .map(|age| age > window)
        .unwrap_or(false)
}

fn prune(
    state: &TelemetryState,
    now: DateTime<Utc>,
    test_retention: Duration,
    notification_retention: Duration,
) -> TelemetryState {
    let expired: Vec<&String> = state
        .tests
        .values()
        .filter(|record| record.status.is_terminal())
        .filter(|record| {
            record
                .end_time
                .map(|end| older_than(now, end, test_retention))
                .unwrap_or(false)
        })
        .map(|record| &record.id)
        .collect();

    let mut next = state.clone();
    if !expired.is_empty() {
        let mut tests = (*state.tests).clone();
        for id in &expired {
            tests.remove(*id);
        }
        next.tests = Arc::new(tests);

        if expired.iter().any(|id| state.logs.contains_key(*id)) {
            let mut logs = (*state.logs).clone();
            for id in &expired {
                logs.remove(*id);
            }
            next.logs = Arc::new(logs);
        }
        if expired.iter().any(|id| state.steps.contains_key(*id)) {
            let mut steps = (*state.steps).clone();
            for id in &expired {
                steps.remove(*id);
            }
            next.steps = Arc::new(steps);
        }
        debug!(event = "tests_evicted", count = expired.len());
    }

    let kept: Vec<Notification> = state
        .notifications
        .iter()
        .filter(|notification| !older_than(now, notification.timestamp, notification_retention))
        .cloned()
        .collect();
    if kept.len() != state.notifications.len() {
        debug!(
            event = "notifications_evicted",
            count = state.notifications.len() - kept.len()
        );
        next.notifications = Arc::new(kept);
    }
    next
}

fn clear_test_logs(state: &TelemetryState, test_id: &str) -> TelemetryState {
    if !state.logs.contains_key(test_id) {
        return state.clone();
    }
    let mut logs = (*state.logs).clone();
    logs.remove(test_id);
    TelemetryState {
        logs: Arc::new(logs),
        ..state.clone()
    }
}

/// Drops everything the stream has reported. Connection status, the last
/// error and connection stats survive.
fn clear_all(state: &TelemetryState) -> TelemetryState {
    TelemetryState {
        connection_status: state.connection_status,
        last_error: state.last_error.clone(),
        stats: Arc::clone(&state.stats),
        ..TelemetryState::default()
    }
}
