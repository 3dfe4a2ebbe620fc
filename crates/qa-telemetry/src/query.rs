//! Read-only views over a state snapshot.

use crate::state::{AgentRecord, TelemetryState, TestLogEntry, TestRecord};
use qa_core::{AgentStatus, TestStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFilter {
    pub status: Option<TestStatus>,
    /// Case-insensitive substring matched against name and id.
    pub search: Option<String>,
}

impl TestFilter {
    pub fn status(status: TestStatus) -> Self {
        Self {
            status: Some(status),
            search: None,
        }
    }

    pub fn search(text: impl Into<String>) -> Self {
        Self {
            status: None,
            search: Some(text.into()),
        }
    }

    fn matches(&self, record: &TestRecord, needle: Option<&str>) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        match needle {
            Some(needle) => {
                record.name.to_lowercase().contains(needle) || record.id.to_lowercase().contains(needle)
            }
            None => true,
        }
    }
}

fn sorted_agents<'a>(agents: impl Iterator<Item = &'a AgentRecord>) -> Vec<AgentRecord> {
    let mut agents: Vec<AgentRecord> = agents.cloned().collect();
    agents.sort_by(|left, right| left.name.cmp(&right.name).then_with(|| left.id.cmp(&right.id)));
    agents
}

fn same_text(left: Option<&str>, right: &str) -> bool {
    left.map(|value| value.eq_ignore_ascii_case(right.trim()))
        .unwrap_or(false)
}

pub fn agents_by_status(state: &TelemetryState, status: AgentStatus) -> Vec<AgentRecord> {
    sorted_agents(state.agents.iter().filter(|agent| agent.status == status))
}

pub fn agents_by_type(state: &TelemetryState, agent_type: &str) -> Vec<AgentRecord> {
    sorted_agents(
        state
            .agents
            .iter()
            .filter(|agent| same_text(agent.agent_type.as_deref(), agent_type)),
    )
}

pub fn agents_by_browser(state: &TelemetryState, browser: &str) -> Vec<AgentRecord> {
    sorted_agents(
        state
            .agents
            .iter()
            .filter(|agent| same_text(agent.browser.as_deref(), browser)),
    )
}

pub fn agents_by_health(state: &TelemetryState, health: &str) -> Vec<AgentRecord> {
    sorted_agents(state.agents.iter().filter(|agent| {
        same_text(
            agent.health_check.as_ref().map(|check| check.status.as_str()),
            health,
        )
    }))
}

pub fn find_agent(state: &TelemetryState, agent_id: &str) -> Option<AgentRecord> {
    state.agent(agent_id).cloned()
}

/// Tests matching `filter`, oldest start first.
pub fn filter_tests(state: &TelemetryState, filter: &TestFilter) -> Vec<TestRecord> {
    let needle = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|needle| !needle.is_empty())
        .map(str::to_lowercase);
    let mut tests: Vec<TestRecord> = state
        .tests
        .values()
        .filter(|record| filter.matches(record, needle.as_deref()))
        .cloned()
        .collect();
    tests.sort_by(|left, right| {
        left.start_time
            .cmp(&right.start_time)
            .then_with(|| left.id.cmp(&right.id))
    });
    tests
}

pub fn running_tests(state: &TelemetryState) -> Vec<TestRecord> {
    filter_tests(state, &TestFilter::status(TestStatus::Running))
}

pub fn test_logs(state: &TelemetryState, test_id: &str) -> Vec<TestLogEntry> {
    state.logs_for(test_id).to_vec()
}
