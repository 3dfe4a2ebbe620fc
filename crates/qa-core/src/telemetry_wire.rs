use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Logical channels every client subscribes to after connecting.
pub const TELEMETRY_CHANNELS: [&str; 4] = ["tests", "agents", "queue", "logs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a telemetry protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                cleaned
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

/// A server notification as it arrives on the stream. The payload stays
/// untyped here; the telemetry normalizer is the only place it is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub client_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: ClientMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientMsg {
    Hello(CapabilityAnnouncement),
    Subscribe(SubscribeRequest),
    Ping(PingPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityAnnouncement {
    pub client_id: String,
    pub client_name: String,
    pub client_version: String,
    #[serde(default)]
    pub supports_compression: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingPayload {
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Encodes one message as a single JSON text frame.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> ClientEnvelope {
        ClientEnvelope {
            version: ProtocolVersion::CURRENT,
            client_id: "qa-monitor-7".to_string(),
            timestamp: "2026-10-18T09:00:00Z".to_string(),
            msg: ClientMsg::Hello(CapabilityAnnouncement {
                client_id: "qa-monitor-7".to_string(),
                client_name: "qa-monitor".to_string(),
                client_version: "0.1.0".to_string(),
                supports_compression: true,
                capabilities: vec!["latency_probe".to_string()],
            }),
        }
    }

    #[test]
    fn client_envelope_uses_event_and_payload_keys() {
        let frame = encode_frame(&hello(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["event"], "hello");
        assert_eq!(value["version"], "1");
        assert_eq!(value["payload"]["supports_compression"], true);

        let decoded: ClientEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, hello());
    }

    #[test]
    fn subscribe_lists_all_channels() {
        let envelope = ClientEnvelope {
            msg: ClientMsg::Subscribe(SubscribeRequest {
                channels: TELEMETRY_CHANNELS.iter().map(|c| c.to_string()).collect(),
            }),
            ..hello()
        };
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(frame.contains("\"event\":\"subscribe\""));
        assert!(frame.contains("\"queue\""));
    }

    #[test]
    fn inbound_envelope_tolerates_missing_payload_and_version() {
        let inbound: InboundEnvelope =
            decode_frame(r#"{"event":"queue_status"}"#, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(inbound.event, "queue_status");
        assert_eq!(inbound.payload, Value::Null);
        assert_eq!(inbound.version, ProtocolVersion::CURRENT);

        let numeric: InboundEnvelope = decode_frame(
            "{\"event\":\"testStarted\",\"version\":1,\"payload\":{\"id\":\"t1\"}}\n",
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode numeric version");
        assert_eq!(numeric.version, ProtocolVersion(1));
        assert_eq!(numeric.payload["id"], "t1");

        let prefixed: InboundEnvelope =
            decode_frame(r#"{"event":"pong","version":"v1"}"#, DEFAULT_MAX_FRAME_BYTES)
                .expect("decode prefixed version");
        assert_eq!(prefixed.version, ProtocolVersion(1));
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let result = encode_frame(&hello(), 16);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));

        let big = format!("{{\"event\":\"log\",\"payload\":\"{}\"}}", "x".repeat(512));
        let decoded = decode_frame::<InboundEnvelope>(&big, 128);
        assert!(matches!(decoded, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let decoded = decode_frame::<InboundEnvelope>("{\"event\":", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(decoded, Err(FrameError::Decode(_))));
    }
}
