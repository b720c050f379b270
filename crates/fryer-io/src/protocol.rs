use fryer_core::{tags, FryerSnapshot, StartError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tags whose `key` is a field of every status message.
pub const STATUS_TAGS: &[tags::Tag] = &[
    tags::OIL_TEMP_C,
    tags::TARGET_TEMP_C,
    tags::ELEMENT1_ON,
    tags::ELEMENT2_ON,
    tags::BASKET_POSITION,
    tags::FRY_PHASE,
    tags::LINK_CONNECTED,
    tags::EMERGENCY_LATCHED,
];

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// Messages without a version are treated as 1.0.
    pub fn is_supported(&self) -> bool {
        self.major == 1 || (self.major == 0 && self.minor == 0)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Json(_) | ProtocolError::MissingType => "bad_request",
            ProtocolError::UnknownType(_) => "unknown_type",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    pub label: String,
    pub target_c: f64,
    pub duration_s: u32,
}

/// Messages with no payload beyond their type.
#[derive(Debug, Default, Deserialize)]
pub struct BareMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    Start(StartMsg),
    EmergencyStop(BareMsg),
    Reset(BareMsg),
    Status(BareMsg),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        let msg = match msg_type.as_str() {
            "hello" => IncomingMessage::Hello(serde_json::from_value(value)?),
            "start" => IncomingMessage::Start(serde_json::from_value(value)?),
            "emergency_stop" => IncomingMessage::EmergencyStop(serde_json::from_value(value)?),
            "reset" => IncomingMessage::Reset(serde_json::from_value(value)?),
            "status" => IncomingMessage::Status(serde_json::from_value(value)?),
            _ => return Err(ProtocolError::UnknownType(msg_type)),
        };
        Ok(msg)
    }

    /// Name echoed back in `ack` and `error` replies.
    pub fn command(&self) -> &'static str {
        match self {
            IncomingMessage::Hello(_) => "hello",
            IncomingMessage::Start(_) => "start",
            IncomingMessage::EmergencyStop(_) => "emergency_stop",
            IncomingMessage::Reset(_) => "reset",
            IncomingMessage::Status(_) => "status",
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            IncomingMessage::Hello(m) => m.protocol_version,
            IncomingMessage::Start(m) => m.protocol_version,
            IncomingMessage::EmergencyStop(m)
            | IncomingMessage::Reset(m)
            | IncomingMessage::Status(m) => m.protocol_version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub phase: &'static str,
    pub message: String,
    pub progress: Option<f32>,
    pub temperature_c: f64,
    pub target_c: Option<f64>,
    pub element1: bool,
    pub element2: bool,
    pub basket: &'static str,
    pub link: &'static str,
    pub emergency_latched: bool,
    pub job: Option<String>,
}

impl StatusMsg {
    pub fn from_snapshot(snapshot: &FryerSnapshot, sequence: u64, unix_us: u64) -> Self {
        Self {
            msg_type: "status",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            timestamp_us: snapshot.status.timestamp_us.max(snapshot.timestamp_us),
            unix_us,
            phase: snapshot.status.phase.as_str(),
            message: snapshot.status.message.clone(),
            progress: snapshot.status.progress,
            temperature_c: snapshot.temperature_c,
            target_c: snapshot.target_c,
            element1: snapshot.heating.element1,
            element2: snapshot.heating.element2,
            basket: snapshot.basket.as_str(),
            link: snapshot.link.as_str(),
            emergency_latched: snapshot.emergency_latched,
            job: snapshot
                .job
                .as_ref()
                .map(|job| job.label().to_string())
                .or_else(|| snapshot.status.job.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AckMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub command: &'static str,
}

impl AckMsg {
    pub fn new(command: &'static str) -> Self {
        Self {
            msg_type: "ack",
            command,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub command: Option<&'static str>,
    pub code: &'static str,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(command: Option<&'static str>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            msg_type: "error",
            command,
            code,
            message: message.into(),
        }
    }

    pub fn rejected_start(err: &StartError) -> Self {
        Self::new(Some("start"), err.code(), err.to_string())
    }
}
