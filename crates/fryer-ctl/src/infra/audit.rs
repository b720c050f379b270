//! Audit trail for fry jobs and emergency stops.
//!
//! Entries are appended as JSON lines. Job and interlock events are derived
//! from the controller's status stream by [`AuditTracker`].

use fryer_core::{CycleStatus, FryPhase, FryerSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// A job left Idle/Done/Aborted for Heating
    JobStarted,
    PhaseChanged,
    JobCompleted,
    /// A running job ended in Aborted
    JobAborted,
    EmergencyStop,
    EmergencyReset,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }
}

/// Turns status events into audit events.
#[derive(Debug, Default)]
pub struct AuditTracker {
    phase: FryPhase,
    latched: bool,
}

impl AuditTracker {
    pub fn observe(
        &mut self,
        status: &CycleStatus,
        snapshot: &FryerSnapshot,
    ) -> Vec<(AuditEventType, serde_json::Value)> {
        let mut events = Vec::new();
        let from = self.phase;
        let to = status.phase;
        let job = snapshot.job.as_ref();
        // The snapshot's job slot is already empty once a cycle has ended.
        let label = status.job.as_deref().or(job.map(|j| j.label()));

        if snapshot.emergency_latched && !self.latched {
            events.push((
                AuditEventType::EmergencyStop,
                json!({ "phase": from, "job": label }),
            ));
        }
        if !snapshot.emergency_latched && self.latched && to == FryPhase::Idle {
            events.push((AuditEventType::EmergencyReset, json!({})));
        }

        if from != to {
            if to == FryPhase::Heating {
                events.push((
                    AuditEventType::JobStarted,
                    json!({
                        "label": label,
                        "target_c": job.map(|j| j.target_c()),
                        "duration_s": job.map(|j| j.duration_s()),
                    }),
                ));
            }
            events.push((
                AuditEventType::PhaseChanged,
                json!({ "from": from, "to": to, "message": status.message }),
            ));
            match to {
                FryPhase::Done => events.push((
                    AuditEventType::JobCompleted,
                    json!({ "label": label }),
                )),
                FryPhase::Aborted if from.is_running() => events.push((
                    AuditEventType::JobAborted,
                    json!({ "label": label, "reason": status.message }),
                )),
                _ => {}
            }
        }

        self.phase = to;
        self.latched = snapshot.emergency_latched;
        events
    }
}
