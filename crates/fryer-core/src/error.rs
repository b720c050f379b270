use crate::hal::Command;
use std::io;
use thiserror::Error;

/// Failures of the serial transport.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("serial link is not connected")]
    NotConnected,
    #[error("{command} cancelled before it was written")]
    Cancelled { command: Command },
    #[error("{command} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        command: Command,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Failures of a timed basket actuation.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("serial link unavailable for {command}")]
    LinkUnavailable { command: Command },
    #[error("{command} send failed: {source}")]
    SendFailed {
        command: Command,
        #[source]
        source: LinkError,
    },
    #[error("{command} interrupted by abort")]
    Aborted { command: Command },
}

/// A telemetry line that carried no temperature reading.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no temperature reading in telemetry line {line:?}")]
pub struct ParseError {
    pub line: String,
}

/// Reasons a fry job is refused. Refusals have no side effects.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StartError {
    #[error("job already running: {active}")]
    JobConflict { active: String },
    #[error("target temperature {requested}°C outside {min}..={max}°C")]
    TargetOutOfRange { requested: f64, min: f64, max: f64 },
    #[error("fry duration {requested}s outside {min}..={max}s")]
    DurationOutOfRange { requested: u32, min: u32, max: u32 },
    #[error("emergency stop is latched; reset required")]
    EmergencyLatched,
    #[error("failed to spawn fry cycle worker: {reason}")]
    WorkerSpawn { reason: String },
}

impl StartError {
    /// Stable machine-readable code for remote callers.
    pub fn code(&self) -> &'static str {
        match self {
            StartError::JobConflict { .. } => "job_conflict",
            StartError::TargetOutOfRange { .. } | StartError::DurationOutOfRange { .. } => {
                "input_range"
            }
            StartError::EmergencyLatched => "emergency_latched",
            StartError::WorkerSpawn { .. } => "internal",
        }
    }
}
