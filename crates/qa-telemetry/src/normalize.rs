//! Maps raw stream notifications onto [`TelemetryEvent`]s.
//!
//! This is the only place that reads untyped payloads. Identifiers are found
//! through fallback key chains and an event without one is rejected, so a
//! partial notification can never reach the store. Log lines carry a second,
//! text-encoded stream (step progress and terminal markers) that is parsed
//! out here as well.

use crate::error::NormalizeError;
use crate::event::{
    AgentEventKind, AgentPatch, AgentUpdate, EventKind, EventOrigin, StepPhase, TelemetryEvent,
    TestOutcome,
};
use crate::state::{AgentResources, QueueStatusSummary, TestStatusSummary};
use chrono::{DateTime, TimeZone, Utc};
use qa_core::telemetry_wire::InboundEnvelope;
use qa_core::{AgentStatus, LogLevel};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::warn;

const TEST_ID_KEYS: &[&str] = &["id", "testId", "test_id"];
const AGENT_ID_KEYS: &[&str] = &["agentId", "agent_id", "id"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "time", "ts"];
const TEST_NAME_KEYS: &[&str] = &["name", "testName", "test_name", "title"];
const TOTAL_STEPS_KEYS: &[&str] = &["totalSteps", "total_steps", "total"];
const STEP_NUMBER_KEYS: &[&str] = &["stepNumber", "step_number", "step", "currentStep", "current"];
const STEP_DESCRIPTION_KEYS: &[&str] = &["description", "stepDescription", "step_description", "action"];
const FAILURE_KEYS: &[&str] = &["error", "message", "reason"];
const ABORT_KEYS: &[&str] = &["reason", "error", "message"];
const LOG_MESSAGE_KEYS: &[&str] = &["message", "msg", "text", "line"];
const LOG_LEVEL_KEYS: &[&str] = &["level", "severity"];
const AGENT_NAME_KEYS: &[&str] = &["name", "agentName", "hostname"];
const AGENT_STATUS_KEYS: &[&str] = &["status", "state"];
const AGENT_NEW_STATE_KEYS: &[&str] = &["newState", "new_state", "state", "status"];
const AGENT_TYPE_KEYS: &[&str] = &["type", "agentType", "agent_type"];
const BROWSER_KEYS: &[&str] = &["browser", "browserName", "browser_name"];
const IP_KEYS: &[&str] = &["ip", "ipAddress", "ip_address"];
const VERSION_KEYS: &[&str] = &["version", "agentVersion", "agent_version"];
const RESOURCE_CONTAINER_KEYS: &[&str] = &["resources", "metrics", "performance"];
const CPU_KEYS: &[&str] = &["cpu", "cpuUsage", "cpu_usage"];
const MEMORY_KEYS: &[&str] = &["memory", "memoryUsage", "memory_usage"];
const DISK_KEYS: &[&str] = &["disk", "diskUsage", "disk_usage"];
const NETWORK_KEYS: &[&str] = &["network", "networkUsage", "network_usage"];
const HEALTH_CONTAINER_KEYS: &[&str] = &["healthCheck", "health_check", "health"];
const HEALTH_STATUS_KEYS: &[&str] = &["healthStatus", "health_status", "status"];
const CRASH_REASON_KEYS: &[&str] = &["error", "reason", "message"];
const PROBE_KEYS: &[&str] = &["timestamp_ms", "timestampMs", "timestamp", "sentAt"];

/// A step marker found in a log line, e.g. `step 2/5 running: open login page`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    pub phase: StepPhase,
    pub step_number: u32,
    pub total_steps: u32,
    pub description: Option<String>,
}

pub fn normalize_envelope(
    envelope: &InboundEnvelope,
    received_at: DateTime<Utc>,
) -> Result<Vec<TelemetryEvent>, NormalizeError> {
    let default_at = envelope
        .timestamp
        .as_ref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);
    normalize_at(&envelope.event, &envelope.payload, default_at, received_at)
}

pub fn normalize(
    name: &str,
    payload: &Value,
    received_at: DateTime<Utc>,
) -> Result<Vec<TelemetryEvent>, NormalizeError> {
    normalize_at(name, payload, received_at, received_at)
}

fn normalize_at(
    name: &str,
    payload: &Value,
    default_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
) -> Result<Vec<TelemetryEvent>, NormalizeError> {
    let kind = EventKind::from_wire_name(name)
        .ok_or_else(|| NormalizeError::Unrecognized(name.to_string()))?;
    let at = timestamp_field(payload, TIMESTAMP_KEYS).unwrap_or(default_at);

    match kind {
        EventKind::TestStarted => Ok(vec![TelemetryEvent::TestStarted {
            test_id: require_id(kind, payload, TEST_ID_KEYS)?,
            name: string_field(payload, TEST_NAME_KEYS),
            total_steps: u32_field(payload, TOTAL_STEPS_KEYS),
            at,
        }]),
        EventKind::TestCompleted | EventKind::TestFailed | EventKind::TestAborted => {
            let test_id = require_id(kind, payload, TEST_ID_KEYS)?;
            let (outcome, error) = match kind {
                EventKind::TestFailed => (TestOutcome::Failed, string_field(payload, FAILURE_KEYS)),
                EventKind::TestAborted => (TestOutcome::Aborted, string_field(payload, ABORT_KEYS)),
                _ => (TestOutcome::Completed, None),
            };
            Ok(vec![TelemetryEvent::TestFinished {
                test_id,
                outcome,
                error,
                origin: EventOrigin::Wire,
                at,
            }])
        }
        EventKind::TestLog => normalize_log(kind, payload, at),
        EventKind::StepStarted | EventKind::StepCompleted => {
            let test_id = require_id(kind, payload, TEST_ID_KEYS)?;
            let step_number = u32_field(payload, STEP_NUMBER_KEYS)
                .ok_or_else(|| invalid(kind, "missing step number"))?;
            let phase = if kind == EventKind::StepStarted {
                StepPhase::Started
            } else {
                StepPhase::Completed
            };
            Ok(vec![TelemetryEvent::Step {
                test_id,
                phase,
                step_number,
                total_steps: u32_field(payload, TOTAL_STEPS_KEYS),
                description: string_field(payload, STEP_DESCRIPTION_KEYS),
                origin: EventOrigin::Wire,
                at,
            }])
        }
        EventKind::AgentStatus
        | EventKind::AgentDetails
        | EventKind::AgentPerformance
        | EventKind::AgentHealth
        | EventKind::AgentCrashed
        | EventKind::AgentStateChanged => normalize_agent(kind, payload, at),
        EventKind::QueueStatus => {
            let summary: QueueStatusSummary = verbatim(kind, payload)?;
            Ok(vec![TelemetryEvent::QueueStatus(summary)])
        }
        EventKind::TestStatuses => {
            let summary: TestStatusSummary = verbatim(kind, payload)?;
            Ok(vec![TelemetryEvent::TestStatuses(summary)])
        }
        EventKind::Pong => {
            let sent_ms = i64_field(payload, PROBE_KEYS)
                .or_else(|| payload.as_i64())
                .ok_or_else(|| invalid(kind, "missing probe timestamp"))?;
            let elapsed_ms = received_at
                .timestamp_millis()
                .checked_sub(sent_ms)
                .ok_or_else(|| invalid(kind, "probe timestamp out of range"))?;
            let latency_ms = elapsed_ms.max(0) as u64;
            Ok(vec![TelemetryEvent::LatencyMeasured { latency_ms }])
        }
    }
}

fn normalize_log(
    kind: EventKind,
    payload: &Value,
    at: DateTime<Utc>,
) -> Result<Vec<TelemetryEvent>, NormalizeError> {
    let test_id = require_id(kind, payload, TEST_ID_KEYS)?;
    let message = string_field(payload, LOG_MESSAGE_KEYS)
        .ok_or_else(|| invalid(kind, "missing message"))?;
    let level = string_field(payload, LOG_LEVEL_KEYS)
        .and_then(|raw| raw.parse::<LogLevel>().ok())
        .unwrap_or_default();

    let mut events = vec![TelemetryEvent::TestLog {
        test_id: test_id.clone(),
        level,
        message: message.clone(),
        name: string_field(payload, TEST_NAME_KEYS),
        at,
    }];

    if let Some(progress) = match_step_progress(&message) {
        events.push(TelemetryEvent::Step {
            test_id: test_id.clone(),
            phase: progress.phase,
            step_number: progress.step_number,
            total_steps: Some(progress.total_steps),
            description: progress.description,
            origin: EventOrigin::LogText,
            at,
        });
    }
    if let Some((outcome, error)) = match_terminal_marker(&message) {
        events.push(TelemetryEvent::TestFinished {
            test_id,
            outcome,
            error,
            origin: EventOrigin::LogText,
            at,
        });
    }
    Ok(events)
}

fn normalize_agent(
    kind: EventKind,
    payload: &Value,
    at: DateTime<Utc>,
) -> Result<Vec<TelemetryEvent>, NormalizeError> {
    let agent_id = require_id(kind, payload, AGENT_ID_KEYS)?;
    let agent_kind = match kind {
        EventKind::AgentDetails => AgentEventKind::Details,
        EventKind::AgentPerformance => AgentEventKind::Performance,
        EventKind::AgentHealth => AgentEventKind::Health,
        EventKind::AgentCrashed => AgentEventKind::Crashed,
        EventKind::AgentStateChanged => AgentEventKind::StateChanged,
        _ => AgentEventKind::Status,
    };

    // On health events a bare `status` describes the health check, not the agent.
    let status_keys: &[&str] = match agent_kind {
        AgentEventKind::Health => &["agentStatus", "agent_status"],
        AgentEventKind::StateChanged => AGENT_NEW_STATE_KEYS,
        _ => AGENT_STATUS_KEYS,
    };

    let mut patch = AgentPatch {
        name: string_field(payload, AGENT_NAME_KEYS),
        status: agent_status_field(&agent_id, payload, status_keys),
        agent_type: string_field(payload, AGENT_TYPE_KEYS),
        browser: string_field(payload, BROWSER_KEYS),
        ip: string_field(payload, IP_KEYS),
        version: string_field(payload, VERSION_KEYS),
        capabilities: capabilities_field(payload),
        resources: resources_field(payload),
        ..AgentPatch::default()
    };

    if let Some(container) = object_field(payload, HEALTH_CONTAINER_KEYS) {
        patch.health_status = string_field(container, &["status"]);
        patch.health_message = string_field(container, &["message", "details"]);
    } else if let Some(health) = string_field(payload, &["health"]) {
        patch.health_status = Some(health);
    }

    match agent_kind {
        AgentEventKind::Health => {
            if patch.health_status.is_none() {
                patch.health_status = string_field(payload, HEALTH_STATUS_KEYS);
            }
            if patch.health_message.is_none() {
                patch.health_message = string_field(payload, &["message", "details"]);
            }
        }
        AgentEventKind::Crashed => {
            patch.status = Some(AgentStatus::Error);
            patch.error = Some(
                string_field(payload, CRASH_REASON_KEYS).unwrap_or_else(|| "agent crashed".to_string()),
            );
        }
        _ => {
            patch.error = string_field(payload, &["error"]);
        }
    }

    Ok(vec![TelemetryEvent::Agent(AgentUpdate {
        agent_id,
        kind: agent_kind,
        patch,
        at,
    })])
}

/// Matches `step N/M <running|started|completed|done|...>[: description]`.
pub fn match_step_progress(message: &str) -> Option<StepProgress> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\bstep\s+(\d+)\s*/\s*(\d+)\s+(running|started|starting|completed|complete|done|finished|passed)\b\s*:?\s*(.*)$",
        )
        .expect("valid regex")
    });
    let captures = pattern.captures(message)?;
    let step_number = captures.get(1)?.as_str().parse::<u32>().ok()?;
    let total_steps = captures.get(2)?.as_str().parse::<u32>().ok()?;
    let phase = match captures.get(3)?.as_str().to_ascii_lowercase().as_str() {
        "running" | "started" | "starting" => StepPhase::Started,
        _ => StepPhase::Completed,
    };
    let description = captures
        .get(4)
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty());
    Some(StepProgress {
        phase,
        step_number,
        total_steps,
        description,
    })
}

/// Matches the terminal markers runners print at the end of a test:
/// `test failed[: reason]`, `test aborted`/`cancelled`, and
/// `test completed`/`passed`/`succeeded`.
pub fn match_terminal_marker(message: &str) -> Option<(TestOutcome, Option<String>)> {
    static FAILED: OnceLock<Regex> = OnceLock::new();
    static ABORTED: OnceLock<Regex> = OnceLock::new();
    static COMPLETED: OnceLock<Regex> = OnceLock::new();

    let failed = FAILED
        .get_or_init(|| Regex::new(r"(?i)\btest\s+failed\b\s*:?\s*(.*)$").expect("valid regex"));
    if let Some(captures) = failed.captures(message) {
        let reason = captures
            .get(1)
            .map(|value| value.as_str().trim().to_string())
            .filter(|value| !value.is_empty());
        return Some((TestOutcome::Failed, reason));
    }

    let aborted = ABORTED.get_or_init(|| {
        Regex::new(r"(?i)\btest\s+(?:aborted|cancelled|canceled)\b").expect("valid regex")
    });
    if aborted.is_match(message) {
        return Some((TestOutcome::Aborted, None));
    }

    let completed = COMPLETED.get_or_init(|| {
        Regex::new(r"(?i)\btest\s+(?:completed|passed|succeeded)\b").expect("valid regex")
    });
    if completed.is_match(message) {
        return Some((TestOutcome::Completed, None));
    }
    None
}

fn invalid(kind: EventKind, reason: &str) -> NormalizeError {
    NormalizeError::InvalidPayload {
        event: kind.as_str().to_string(),
        reason: reason.to_string(),
    }
}

fn require_id(kind: EventKind, payload: &Value, keys: &[&str]) -> Result<String, NormalizeError> {
    string_field(payload, keys).ok_or_else(|| NormalizeError::MissingIdentifier {
        event: kind.as_str().to_string(),
        tried: keys.join("|"),
    })
}

fn verbatim<T: DeserializeOwned>(kind: EventKind, payload: &Value) -> Result<T, NormalizeError> {
    if !payload.is_object() {
        return Err(invalid(kind, "expected an object payload"));
    }
    serde_json::from_value(payload.clone()).map_err(|err| invalid(kind, &err.to_string()))
}

fn value_by_keys<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let map = payload.as_object()?;
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null())
}

fn object_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    value_by_keys(payload, keys).filter(|value| value.is_object())
}

fn string_field(payload: &Value, keys: &[&str]) -> Option<String> {
    let map = payload.as_object()?;
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}

fn i64_field(payload: &Value, keys: &[&str]) -> Option<i64> {
    let map = payload.as_object()?;
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(value) => value.as_i64().or_else(|| value.as_f64().map(|v| v as i64)),
        Value::String(value) => value.trim().parse::<i64>().ok(),
        _ => None,
    })
}

fn u32_field(payload: &Value, keys: &[&str]) -> Option<u32> {
    i64_field(payload, keys).and_then(|value| u32::try_from(value).ok())
}

fn f64_field(payload: &Value, keys: &[&str]) -> Option<f64> {
    let map = payload.as_object()?;
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(value) => value.as_f64(),
        Value::String(value) => value.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn timestamp_field(payload: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    value_by_keys(payload, keys).and_then(parse_timestamp)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(raw) => raw
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn agent_status_field(agent_id: &str, payload: &Value, keys: &[&str]) -> Option<AgentStatus> {
    let raw = string_field(payload, keys)?;
    match raw.parse::<AgentStatus>() {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(event = "agent_status_unparsed", agent_id, raw = %raw, error = %err);
            None
        }
    }
}

fn capabilities_field(payload: &Value) -> Option<Vec<String>> {
    match value_by_keys(payload, &["capabilities"])? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        ),
        Value::Object(flags) => Some(enabled_flags(flags)),
        _ => None,
    }
}

fn enabled_flags(flags: &Map<String, Value>) -> Vec<String> {
    flags
        .iter()
        .filter(|(_, value)| value.as_bool().unwrap_or(false))
        .map(|(key, _)| key.clone())
        .collect()
}

fn resources_field(payload: &Value) -> Option<AgentResources> {
    let source = object_field(payload, RESOURCE_CONTAINER_KEYS).unwrap_or(payload);
    let resources = AgentResources {
        cpu: f64_field(source, CPU_KEYS),
        memory: f64_field(source, MEMORY_KEYS),
        disk: f64_field(source, DISK_KEYS),
        network: f64_field(source, NETWORK_KEYS),
    };
    if resources.is_empty() {
        None
    } else {
        Some(resources)
    }
}
