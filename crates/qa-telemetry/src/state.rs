//! The telemetry state tree.
//!
//! Every non-`Copy` slice sits behind an `Arc`. Reducers build a new root and
//! swap in fresh `Arc`s only for the slices they touch, so slice-level change
//! detection is a pointer comparison.

use chrono::{DateTime, Utc};
use qa_core::{AgentStatus, LogLevel, TestStatus};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRecord {
    pub id: String,
    pub name: String,
    pub status: TestStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_step: u32,
    pub total_steps: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestStepSnapshot {
    pub current: u32,
    pub total: u32,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResources {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub disk: Option<f64>,
    #[serde(default)]
    pub network: Option<f64>,
}

impl AgentResources {
    /// Overlays the metrics present in `patch`; metrics it omits keep their
    /// previous values.
    pub fn merged(&self, patch: &AgentResources) -> AgentResources {
        AgentResources {
            cpu: patch.cpu.or(self.cpu),
            memory: patch.memory.or(self.memory),
            disk: patch.disk.or(self.disk),
            network: patch.network.or(self.network),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.disk.is_none() && self.network.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub agent_type: Option<String>,
    pub browser: Option<String>,
    pub ip: Option<String>,
    pub version: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub resources: Option<AgentResources>,
    pub health_check: Option<HealthCheck>,
    pub last_seen: DateTime<Utc>,
    pub error: Option<String>,
}

impl AgentRecord {
    pub fn first_seen(id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            status: AgentStatus::default(),
            agent_type: None,
            browser: None,
            ip: None,
            version: None,
            capabilities: None,
            resources: None,
            health_check: None,
            last_seen: at,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentStatusSummary {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub offline: usize,
    pub error: usize,
    pub maintenance: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentPerformanceSummary {
    pub avg_cpu_usage: Option<f64>,
    pub avg_memory_usage: Option<f64>,
    pub avg_disk_usage: Option<f64>,
    pub avg_network_usage: Option<f64>,
    pub reporting_agents: usize,
}

/// Queue counters as aggregated by the server. Counters are read leniently
/// (integers, integer-valued floats, numeric strings); keys this type does
/// not know are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatusSummary {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl<'de> Deserialize<'de> for QueueStatusSummary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(Self {
            pending: take_count(&mut fields, &["pending", "queued", "waiting"]),
            running: take_count(&mut fields, &["running", "active", "inProgress"]),
            completed: take_count(&mut fields, &["completed"]),
            failed: take_count(&mut fields, &["failed"]),
            total: take_count(&mut fields, &["total", "queueLength", "queue_length"]),
            extra: fields,
        })
    }
}

/// Global test counters as aggregated by the server. Decoded like
/// [`QueueStatusSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestStatusSummary {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl<'de> Deserialize<'de> for TestStatusSummary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(Self {
            total: take_count(&mut fields, &["total"]),
            pending: take_count(&mut fields, &["pending", "queued"]),
            running: take_count(&mut fields, &["running"]),
            completed: take_count(&mut fields, &["completed", "passed"]),
            failed: take_count(&mut fields, &["failed"]),
            aborted: take_count(&mut fields, &["aborted", "cancelled"]),
            extra: fields,
        })
    }
}

/// Removes every readable counter among `keys` and returns the first one in
/// key order. Unreadable values stay in `fields`.
fn take_count(fields: &mut BTreeMap<String, Value>, keys: &[&str]) -> u64 {
    let mut count = None;
    for key in keys {
        let Some(parsed) = fields.get(*key).and_then(lenient_count) else {
            continue;
        };
        fields.remove(*key);
        count.get_or_insert(parsed);
    }
    count.unwrap_or_default()
}

fn lenient_count(value: &Value) -> Option<u64> {
    let whole = |raw: f64| (raw.is_finite() && raw >= 0.0 && raw.fract() == 0.0).then_some(raw as u64);
    match value {
        Value::Number(number) => number.as_u64().or_else(|| number.as_f64().and_then(whole)),
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse::<u64>()
                .ok()
                .or_else(|| raw.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub messages_received: u64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    pub latency_ms: Option<u64>,
    pub connected_since: Option<DateTime<Utc>>,
}

pub type TestMap = BTreeMap<String, TestRecord>;
pub type LogMap = BTreeMap<String, Vec<TestLogEntry>>;
pub type StepMap = BTreeMap<String, TestStepSnapshot>;

/// One top-level branch of [`TelemetryState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slice {
    ConnectionStatus,
    LastError,
    Tests,
    Logs,
    Steps,
    Agents,
    AgentStatusSummary,
    AgentPerformance,
    QueueStatus,
    TestStatuses,
    Notifications,
    Stats,
}

impl Slice {
    pub const ALL: [Slice; 12] = [
        Slice::ConnectionStatus,
        Slice::LastError,
        Slice::Tests,
        Slice::Logs,
        Slice::Steps,
        Slice::Agents,
        Slice::AgentStatusSummary,
        Slice::AgentPerformance,
        Slice::QueueStatus,
        Slice::TestStatuses,
        Slice::Notifications,
        Slice::Stats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slice::ConnectionStatus => "connection_status",
            Slice::LastError => "last_error",
            Slice::Tests => "tests",
            Slice::Logs => "logs",
            Slice::Steps => "steps",
            Slice::Agents => "agents",
            Slice::AgentStatusSummary => "agent_status_summary",
            Slice::AgentPerformance => "agent_performance",
            Slice::QueueStatus => "queue_status",
            Slice::TestStatuses => "test_statuses",
            Slice::Notifications => "notifications",
            Slice::Stats => "stats",
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryState {
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    pub tests: Arc<TestMap>,
    pub logs: Arc<LogMap>,
    pub steps: Arc<StepMap>,
    pub agents: Arc<Vec<AgentRecord>>,
    pub agent_status_summary: Arc<AgentStatusSummary>,
    pub agent_performance: Arc<AgentPerformanceSummary>,
    pub queue_status: Option<Arc<QueueStatusSummary>>,
    pub test_statuses: Option<Arc<TestStatusSummary>>,
    pub notifications: Arc<Vec<Notification>>,
    pub stats: Arc<ConnectionStats>,
}

fn same_optional<T>(left: &Option<Arc<T>>, right: &Option<Arc<T>>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        _ => false,
    }
}

impl TelemetryState {
    /// Slices whose identity differs between `self` and `next`, in
    /// [`Slice::ALL`] order.
    pub fn changed_slices(&self, next: &TelemetryState) -> Vec<Slice> {
        Slice::ALL
            .into_iter()
            .filter(|slice| !self.same_slice(next, *slice))
            .collect()
    }

    fn same_slice(&self, other: &TelemetryState, slice: Slice) -> bool {
        match slice {
            Slice::ConnectionStatus => self.connection_status == other.connection_status,
            Slice::LastError => self.last_error == other.last_error,
            Slice::Tests => Arc::ptr_eq(&self.tests, &other.tests),
            Slice::Logs => Arc::ptr_eq(&self.logs, &other.logs),
            Slice::Steps => Arc::ptr_eq(&self.steps, &other.steps),
            Slice::Agents => Arc::ptr_eq(&self.agents, &other.agents),
            Slice::AgentStatusSummary => {
                Arc::ptr_eq(&self.agent_status_summary, &other.agent_status_summary)
            }
            Slice::AgentPerformance => {
                Arc::ptr_eq(&self.agent_performance, &other.agent_performance)
            }
            Slice::QueueStatus => same_optional(&self.queue_status, &other.queue_status),
            Slice::TestStatuses => same_optional(&self.test_statuses, &other.test_statuses),
            Slice::Notifications => Arc::ptr_eq(&self.notifications, &other.notifications),
            Slice::Stats => Arc::ptr_eq(&self.stats, &other.stats),
        }
    }

    pub fn test(&self, test_id: &str) -> Option<&TestRecord> {
        self.tests.get(test_id)
    }

    pub fn logs_for(&self, test_id: &str) -> &[TestLogEntry] {
        self.logs.get(test_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn step_for(&self, test_id: &str) -> Option<&TestStepSnapshot> {
        self.steps.get(test_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|agent| agent.id == agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_every_slice() {
        let state = TelemetryState::default();
        let copy = state.clone();
        assert!(state.changed_slices(&copy).is_empty());
    }

    #[test]
    fn replacing_one_arc_flags_only_that_slice() {
        let state = TelemetryState::default();
        let mut next = state.clone();
        next.agents = Arc::new(Vec::new());
        assert_eq!(state.changed_slices(&next), vec![Slice::Agents]);
    }

    #[test]
    fn equal_content_in_a_new_arc_still_counts_as_changed() {
        let state = TelemetryState::default();
        let next = TelemetryState {
            tests: Arc::new(TestMap::new()),
            queue_status: Some(Arc::new(QueueStatusSummary::default())),
            ..state.clone()
        };
        assert_eq!(
            state.changed_slices(&next),
            vec![Slice::Tests, Slice::QueueStatus]
        );
    }

    #[test]
    fn copy_slices_compare_by_value() {
        let state = TelemetryState::default();
        let next = TelemetryState {
            connection_status: ConnectionStatus::Disconnected,
            last_error: None,
            ..state.clone()
        };
        assert!(state.changed_slices(&next).is_empty());

        let failed = TelemetryState {
            connection_status: ConnectionStatus::Error,
            last_error: Some("refused".to_string()),
            ..state.clone()
        };
        assert_eq!(
            state.changed_slices(&failed),
            vec![Slice::ConnectionStatus, Slice::LastError]
        );
    }

    #[test]
    fn queue_summary_keeps_unknown_server_fields() {
        let summary: QueueStatusSummary = serde_json::from_value(serde_json::json!({
            "queued": 4,
            "active": 2,
            "queueLength": 6,
            "oldestWaitSecs": 31
        }))
        .expect("parse queue summary");
        assert_eq!(summary.pending, 4);
        assert_eq!(summary.running, 2);
        assert_eq!(summary.total, 6);
        assert_eq!(summary.extra.get("oldestWaitSecs"), Some(&serde_json::json!(31)));
    }

    #[test]
    fn summary_counters_accept_floats_and_numeric_strings() {
        let queue: QueueStatusSummary = serde_json::from_value(serde_json::json!({
            "pending": 3.0,
            "running": "2",
            "failed": " 1.0 ",
            "completed": 2.5
        }))
        .expect("parse loose queue summary");
        assert_eq!(queue.pending, 3);
        assert_eq!(queue.running, 2);
        assert_eq!(queue.failed, 1);
        assert_eq!(queue.completed, 0);
        assert_eq!(queue.extra.get("completed"), Some(&serde_json::json!(2.5)));

        let tests: TestStatusSummary = serde_json::from_value(serde_json::json!({
            "total": "12",
            "passed": 9.0,
            "cancelled": -1
        }))
        .expect("parse loose test summary");
        assert_eq!(tests.total, 12);
        assert_eq!(tests.completed, 9);
        assert_eq!(tests.aborted, 0);
    }

    #[test]
    fn canonical_summary_key_wins_over_aliases() {
        let queue: QueueStatusSummary = serde_json::from_value(serde_json::json!({
            "queued": 7,
            "pending": 4,
            "waiting": "9"
        }))
        .expect("parse queue summary with aliases");
        assert_eq!(queue.pending, 4);
        assert!(queue.extra.is_empty());

        let tests: TestStatusSummary = serde_json::from_value(serde_json::json!({
            "completed": 5,
            "passed": 6
        }))
        .expect("parse test summary with aliases");
        assert_eq!(tests.completed, 5);
    }

    #[test]
    fn resource_merge_keeps_unreported_metrics() {
        let previous = AgentResources {
            cpu: Some(40.0),
            memory: Some(60.0),
            ..AgentResources::default()
        };
        let patch = AgentResources {
            cpu: Some(75.0),
            ..AgentResources::default()
        };
        let merged = previous.merged(&patch);
        assert_eq!(merged.cpu, Some(75.0));
        assert_eq!(merged.memory, Some(60.0));
        assert!(merged.disk.is_none());
    }
}
