use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod telemetry_wire;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
            TestStatus::Aborted => "aborted",
        }
    }

    /// Completed, failed and aborted records accept no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Aborted
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" | "queued" | "waiting" => Ok(TestStatus::Pending),
            "running" | "in_progress" | "in-progress" | "started" => Ok(TestStatus::Running),
            "completed" | "complete" | "passed" | "success" | "succeeded" => {
                Ok(TestStatus::Completed)
            }
            "failed" | "failure" | "error" => Ok(TestStatus::Failed),
            "aborted" | "cancelled" | "canceled" | "stopped" => Ok(TestStatus::Aborted),
            other => Err(format!("Unknown test status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Available,
    Busy,
    Offline,
    Error,
    Maintenance,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
            AgentStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "available" | "idle" | "online" | "ready" => Ok(AgentStatus::Available),
            "busy" | "running" | "executing" => Ok(AgentStatus::Busy),
            "offline" | "disconnected" | "stopped" => Ok(AgentStatus::Offline),
            "error" | "crashed" | "failed" => Ok(AgentStatus::Error),
            "maintenance" | "draining" => Ok(AgentStatus::Maintenance),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "info" | "information" | "log" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" | "err" | "fatal" => Ok(LogLevel::Error),
            "debug" | "trace" | "verbose" => Ok(LogLevel::Debug),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}
