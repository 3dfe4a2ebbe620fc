//! Canonical telemetry events.
//!
//! Everything past the normalizer speaks [`TelemetryEvent`]; raw wire names
//! and untyped payloads never reach a reducer.

use crate::state::{AgentResources, QueueStatusSummary, TestStatusSummary};
use chrono::{DateTime, Utc};
use qa_core::{AgentStatus, LogLevel, TestStatus};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TestStarted,
    TestCompleted,
    TestFailed,
    TestAborted,
    TestLog,
    StepStarted,
    StepCompleted,
    AgentStatus,
    AgentDetails,
    AgentPerformance,
    AgentHealth,
    AgentCrashed,
    AgentStateChanged,
    QueueStatus,
    TestStatuses,
    Pong,
}

/// Every spelling the backend has used for each event. Several are migration
/// leftovers; they all collapse onto one kind here.
const EVENT_ALIASES: &[(&str, EventKind)] = &[
    ("test_started", EventKind::TestStarted),
    ("testStarted", EventKind::TestStarted),
    ("test:started", EventKind::TestStarted),
    ("test_start", EventKind::TestStarted),
    ("test_completed", EventKind::TestCompleted),
    ("testCompleted", EventKind::TestCompleted),
    ("test:completed", EventKind::TestCompleted),
    ("test_passed", EventKind::TestCompleted),
    ("test_failed", EventKind::TestFailed),
    ("testFailed", EventKind::TestFailed),
    ("test:failed", EventKind::TestFailed),
    ("test_error", EventKind::TestFailed),
    ("test_aborted", EventKind::TestAborted),
    ("testAborted", EventKind::TestAborted),
    ("test:aborted", EventKind::TestAborted),
    ("test_cancelled", EventKind::TestAborted),
    ("test_log", EventKind::TestLog),
    ("testLog", EventKind::TestLog),
    ("test:log", EventKind::TestLog),
    ("log", EventKind::TestLog),
    ("step_started", EventKind::StepStarted),
    ("stepStarted", EventKind::StepStarted),
    ("test:step_started", EventKind::StepStarted),
    ("test_step", EventKind::StepStarted),
    ("step_completed", EventKind::StepCompleted),
    ("stepCompleted", EventKind::StepCompleted),
    ("test:step_completed", EventKind::StepCompleted),
    ("agent_status", EventKind::AgentStatus),
    ("agentStatus", EventKind::AgentStatus),
    ("agent:status", EventKind::AgentStatus),
    ("agent_details", EventKind::AgentDetails),
    ("agentDetails", EventKind::AgentDetails),
    ("agent:details", EventKind::AgentDetails),
    ("agent_registered", EventKind::AgentDetails),
    ("agent_performance", EventKind::AgentPerformance),
    ("agentPerformance", EventKind::AgentPerformance),
    ("agent:performance", EventKind::AgentPerformance),
    ("agent_metrics", EventKind::AgentPerformance),
    ("agent_health", EventKind::AgentHealth),
    ("agentHealth", EventKind::AgentHealth),
    ("agent:health", EventKind::AgentHealth),
    ("agent_crashed", EventKind::AgentCrashed),
    ("agentCrashed", EventKind::AgentCrashed),
    ("agent:crashed", EventKind::AgentCrashed),
    ("agent_state_changed", EventKind::AgentStateChanged),
    ("agentStateChanged", EventKind::AgentStateChanged),
    ("agent:state_changed", EventKind::AgentStateChanged),
    ("queue_status", EventKind::QueueStatus),
    ("queueStatus", EventKind::QueueStatus),
    ("queue:status", EventKind::QueueStatus),
    ("test_statuses", EventKind::TestStatuses),
    ("testStatuses", EventKind::TestStatuses),
    ("test:statuses", EventKind::TestStatuses),
    ("pong", EventKind::Pong),
    ("latency_pong", EventKind::Pong),
];

impl EventKind {
    pub fn from_wire_name(name: &str) -> Option<Self> {
        let name = name.trim();
        EVENT_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TestStarted => "test_started",
            EventKind::TestCompleted => "test_completed",
            EventKind::TestFailed => "test_failed",
            EventKind::TestAborted => "test_aborted",
            EventKind::TestLog => "test_log",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::AgentStatus => "agent_status",
            EventKind::AgentDetails => "agent_details",
            EventKind::AgentPerformance => "agent_performance",
            EventKind::AgentHealth => "agent_health",
            EventKind::AgentCrashed => "agent_crashed",
            EventKind::AgentStateChanged => "agent_state_changed",
            EventKind::QueueStatus => "queue_status",
            EventKind::TestStatuses => "test_statuses",
            EventKind::Pong => "pong",
        }
    }
}

/// Where an event came from. Events parsed out of a log line's text carry
/// `LogText`; their source line is already in the log list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Wire,
    LogText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Started,
    Completed,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Started => "started",
            StepPhase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Completed,
    Failed,
    Aborted,
}

impl TestOutcome {
    pub fn status(&self) -> TestStatus {
        match self {
            TestOutcome::Completed => TestStatus::Completed,
            TestOutcome::Failed => TestStatus::Failed,
            TestOutcome::Aborted => TestStatus::Aborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventKind {
    Status,
    Details,
    Performance,
    Health,
    Crashed,
    StateChanged,
}

impl AgentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentEventKind::Status => "status",
            AgentEventKind::Details => "details",
            AgentEventKind::Performance => "performance",
            AgentEventKind::Health => "health",
            AgentEventKind::Crashed => "crashed",
            AgentEventKind::StateChanged => "state_changed",
        }
    }
}

/// Fields an agent event may carry. `None` means "not reported", never
/// "clear the field".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub status: Option<AgentStatus>,
    pub agent_type: Option<String>,
    pub browser: Option<String>,
    pub ip: Option<String>,
    pub version: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub resources: Option<AgentResources>,
    pub health_status: Option<String>,
    pub health_message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentUpdate {
    pub agent_id: String,
    pub kind: AgentEventKind,
    pub patch: AgentPatch,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting {
        at: DateTime<Utc>,
    },
    Connected {
        at: DateTime<Utc>,
        reconnect: bool,
    },
    Disconnected {
        reason: String,
        at: DateTime<Utc>,
    },
    Failed {
        message: String,
        at: DateTime<Utc>,
    },
    ReconnectExhausted {
        attempts: u32,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Connection(ConnectionEvent),
    TestStarted {
        test_id: String,
        name: Option<String>,
        total_steps: Option<u32>,
        at: DateTime<Utc>,
    },
    TestLog {
        test_id: String,
        level: LogLevel,
        message: String,
        name: Option<String>,
        at: DateTime<Utc>,
    },
    Step {
        test_id: String,
        phase: StepPhase,
        step_number: u32,
        total_steps: Option<u32>,
        description: Option<String>,
        origin: EventOrigin,
        at: DateTime<Utc>,
    },
    TestFinished {
        test_id: String,
        outcome: TestOutcome,
        error: Option<String>,
        origin: EventOrigin,
        at: DateTime<Utc>,
    },
    Agent(AgentUpdate),
    QueueStatus(QueueStatusSummary),
    TestStatuses(TestStatusSummary),
    LatencyMeasured {
        latency_ms: u64,
    },
    Prune {
        now: DateTime<Utc>,
        test_retention: Duration,
        notification_retention: Duration,
    },
    ClearTestLogs {
        test_id: String,
    },
    ClearAll,
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::Connection(_) => "connection",
            TelemetryEvent::TestStarted { .. } => "test_started",
            TelemetryEvent::TestLog { .. } => "test_log",
            TelemetryEvent::Step { .. } => "step",
            TelemetryEvent::TestFinished { .. } => "test_finished",
            TelemetryEvent::Agent(_) => "agent",
            TelemetryEvent::QueueStatus(_) => "queue_status",
            TelemetryEvent::TestStatuses(_) => "test_statuses",
            TelemetryEvent::LatencyMeasured { .. } => "latency_measured",
            TelemetryEvent::Prune { .. } => "prune",
            TelemetryEvent::ClearTestLogs { .. } => "clear_test_logs",
            TelemetryEvent::ClearAll => "clear_all",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_collapse_to_one_kind() {
        for name in ["test_started", "testStarted", "test:started", "test_start"] {
            assert_eq!(EventKind::from_wire_name(name), Some(EventKind::TestStarted));
        }
        assert_eq!(
            EventKind::from_wire_name(" agentCrashed "),
            Some(EventKind::AgentCrashed)
        );
        assert_eq!(EventKind::from_wire_name("agent_metrics"), Some(EventKind::AgentPerformance));
        assert_eq!(EventKind::from_wire_name("test_exploded"), None);
    }

    #[test]
    fn every_kind_is_reachable_by_its_canonical_name() {
        for (_, kind) in EVENT_ALIASES {
            assert_eq!(EventKind::from_wire_name(kind.as_str()), Some(*kind));
        }
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        assert_eq!(TestOutcome::Failed.status(), TestStatus::Failed);
        assert!(TestOutcome::Aborted.status().is_terminal());
        assert!(TestOutcome::Completed.status().is_terminal());
    }
}
