//! Aggregates derived from the agent list.

use crate::state::{AgentPerformanceSummary, AgentRecord, AgentStatusSummary};
use qa_core::AgentStatus;

pub fn agent_status_summary(agents: &[AgentRecord]) -> AgentStatusSummary {
    let mut summary = AgentStatusSummary {
        total: agents.len(),
        ..AgentStatusSummary::default()
    };
    for agent in agents {
        match agent.status {
            AgentStatus::Available => summary.available += 1,
            AgentStatus::Busy => summary.busy += 1,
            AgentStatus::Offline => summary.offline += 1,
            AgentStatus::Error => summary.error += 1,
            AgentStatus::Maintenance => summary.maintenance += 1,
        }
    }
    summary
}

/// Averages each metric over the agents that report it. An agent with no
/// `memory` reading does not pull the memory average toward zero.
pub fn agent_performance_summary(agents: &[AgentRecord]) -> AgentPerformanceSummary {
    let reporting: Vec<_> = agents
        .iter()
        .filter_map(|agent| agent.resources.as_ref())
        .filter(|resources| !resources.is_empty())
        .collect();

    AgentPerformanceSummary {
        avg_cpu_usage: average(reporting.iter().filter_map(|r| r.cpu)),
        avg_memory_usage: average(reporting.iter().filter_map(|r| r.memory)),
        avg_disk_usage: average(reporting.iter().filter_map(|r| r.disk)),
        avg_network_usage: average(reporting.iter().filter_map(|r| r.network)),
        reporting_agents: reporting.len(),
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .filter(|value| value.is_finite())
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
