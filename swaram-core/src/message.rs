//! Wire records exchanged with the detection server.
//!
//! Every record is a JSON object carried in one WebSocket text frame, with a
//! mandatory `type` tag and a `timestamp`. Unknown fields are ignored on
//! decode; unknown tags decode to [`InboundMessage::Unknown`] instead of
//! failing.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SwaramError;

// ── DetectionMode ────────────────────────────────────────────────

/// Which detector the server should run. Passed through unopinionated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Hand-sign recognition only.
    Sign,
    /// Lip reading only.
    Lip,
    /// Both detectors.
    #[default]
    Both,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::Lip => "lip",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = SwaramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sign" => Ok(Self::Sign),
            "lip" => Ok(Self::Lip),
            "both" => Ok(Self::Both),
            other => Err(SwaramError::Config(format!("unknown detection mode: {other}"))),
        }
    }
}

// ── ControlCommand ───────────────────────────────────────────────

/// Processing control verbs understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Start,
    Stop,
    Pause,
    Resume,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = SwaramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            other => Err(SwaramError::Config(format!("unknown control command: {other}"))),
        }
    }
}

// ── MonotonicClock ───────────────────────────────────────────────

/// Produces wire timestamps (Unix seconds) that never go backwards.
///
/// Anchored to wall time once, then advanced by a monotonic `Instant`, so
/// a system clock step cannot reorder outbound records.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor_secs: f64,
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor_secs: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            origin: Instant::now(),
        }
    }

    /// Seconds since the Unix epoch.
    pub fn now(&self) -> f64 {
        self.anchor_secs + self.origin.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ── OutboundMessage ──────────────────────────────────────────────

/// Records the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Capability/version negotiation, sent in reply to `welcome`.
    Handshake {
        client: String,
        platform: String,
        version: String,
        timestamp: f64,
    },
    /// One compressed camera frame.
    Frame {
        #[serde(with = "base64_bytes")]
        frame: Bytes,
        mode: DetectionMode,
        frame_id: String,
        timestamp: f64,
    },
    /// Switch the server-side detector.
    #[serde(rename = "mode")]
    ModeChange { mode: DetectionMode, timestamp: f64 },
    /// Start/stop/pause/resume processing.
    Control {
        command: ControlCommand,
        timestamp: f64,
    },
    /// Liveness check, answered with `pong`.
    Ping { timestamp: f64 },
}

/// Discriminant of [`OutboundMessage`], for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKind {
    Handshake,
    Frame,
    ModeChange,
    Control,
    Ping,
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::Frame => "frame",
            Self::ModeChange => "mode",
            Self::Control => "control",
            Self::Ping => "ping",
        };
        f.write_str(name)
    }
}

impl OutboundMessage {
    pub fn kind(&self) -> OutboundKind {
        match self {
            Self::Handshake { .. } => OutboundKind::Handshake,
            Self::Frame { .. } => OutboundKind::Frame,
            Self::ModeChange { .. } => OutboundKind::ModeChange,
            Self::Control { .. } => OutboundKind::Control,
            Self::Ping { .. } => OutboundKind::Ping,
        }
    }

    /// Frames are real-time data and never outlive their connection.
    pub fn is_frame(&self) -> bool {
        matches!(self, Self::Frame { .. })
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Self::Handshake { timestamp, .. }
            | Self::Frame { timestamp, .. }
            | Self::ModeChange { timestamp, .. }
            | Self::Control { timestamp, .. }
            | Self::Ping { timestamp } => *timestamp,
        }
    }

    /// Serialize to a single-line JSON text frame.
    pub fn encode(&self) -> Result<String, SwaramError> {
        serde_json::to_string(self).map_err(|e| SwaramError::Encoding(e.to_string()))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ── Inbound payloads ─────────────────────────────────────────────

/// Server greeting, always the first record on a physical connection.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Welcome {
    pub message: Option<String>,
    pub supported_modes: Vec<String>,
    pub server_version: Option<String>,
    pub features: Vec<String>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct HandshakeAck {
    pub message: Option<String>,
    pub client_info: Option<Value>,
    pub timestamp: Option<f64>,
}

/// Raw detector output for one frame. The payload is opaque to the core.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Detection {
    pub detection: Value,
    pub translation: Option<Value>,
    pub frame_id: Option<String>,
    /// Echoed as sent by the server; not limited to known modes.
    pub mode: Option<String>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Translation {
    pub data: Value,
    pub frame_id: Option<String>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub fps: Option<f64>,
    pub queue_size: Option<u64>,
    pub buffer_fill: Option<u64>,
    pub latency: Option<f64>,
    pub timestamp: Option<f64>,
}

/// Error reported by the server. Never closes the connection by itself.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ServerError {
    pub message: String,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ModeChanged {
    pub mode: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ControlResponse {
    pub command: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Health {
    pub status: Option<String>,
    pub connections: Option<u64>,
    pub queue_size: Option<u64>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Status {
    pub message: Option<String>,
    pub queue_position: Option<u64>,
    pub buffer_fill: Option<u64>,
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Pong {
    pub client_timestamp: Option<f64>,
    pub timestamp: Option<f64>,
}

// ── InboundMessage ───────────────────────────────────────────────

/// Records the server sends to the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Welcome(Welcome),
    HandshakeAck(HandshakeAck),
    Detection(Detection),
    Translation(Translation),
    Stats(Stats),
    Error(ServerError),
    ModeChanged(ModeChanged),
    ControlResponse(ControlResponse),
    Health(Health),
    Status(Status),
    Pong(Pong),
    /// A tag this client does not know. Carries the tag for logging.
    #[serde(skip)]
    Unknown(String),
}

impl InboundMessage {
    /// Tags with a typed variant.
    pub const TAGS: &'static [&'static str] = &[
        "welcome",
        "handshake_ack",
        "detection",
        "translation",
        "stats",
        "error",
        "mode_changed",
        "control_response",
        "health",
        "status",
        "pong",
    ];

    /// Decode one text frame.
    ///
    /// Returns `Ok(Unknown(tag))` for unrecognised tags and
    /// `Err(SwaramError::Protocol)` for anything that is not a JSON object
    /// with a string `type`, or a known tag whose fields are ill-typed.
    pub fn decode(text: &str) -> Result<Self, SwaramError> {
        let value: Value = serde_json::from_str(text)?;
        let tag = match value.get("type").and_then(Value::as_str) {
            Some(tag) => tag.to_owned(),
            None => return Err(SwaramError::Protocol("record has no `type` tag".into())),
        };

        if !Self::TAGS.contains(&tag.as_str()) {
            return Ok(Self::Unknown(tag));
        }

        serde_json::from_value(value)
            .map_err(|e| SwaramError::Protocol(format!("malformed `{tag}` record: {e}")))
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Welcome(_) => "welcome",
            Self::HandshakeAck(_) => "handshake_ack",
            Self::Detection(_) => "detection",
            Self::Translation(_) => "translation",
            Self::Stats(_) => "stats",
            Self::Error(_) => "error",
            Self::ModeChanged(_) => "mode_changed",
            Self::ControlResponse(_) => "control_response",
            Self::Health(_) => "health",
            Self::Status(_) => "status",
            Self::Pong(_) => "pong",
            Self::Unknown(tag) => tag,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
