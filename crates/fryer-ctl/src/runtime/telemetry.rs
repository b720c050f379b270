use crate::infra::audit::{AuditLogger, AuditTracker};
use fryer_core::{FryerController, TimeBase};
use fryer_io::metrics::{init_metrics, serve_metrics, MetricsCursor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

pub fn start_metrics_updater(
    controller: Arc<FryerController>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut cursor = MetricsCursor::default();
        while !stop.load(Ordering::Relaxed) {
            cursor.apply(&controller.snapshot(), &controller.stats());
            thread::sleep(Duration::from_millis(200));
        }
    })
}

/// Writes job and interlock events to the audit log as the controller
/// publishes status changes.
pub fn start_audit_recorder(
    controller: Arc<FryerController>,
    logger: Arc<AuditLogger>,
    timebase: TimeBase,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let events = controller.subscribe();
    thread::spawn(move || {
        let mut tracker = AuditTracker::default();
        while !stop.load(Ordering::Relaxed) {
            let status = match events.recv_timeout(Duration::from_millis(200)) {
                Ok(status) => status,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let snapshot = controller.snapshot();
            for (event_type, details) in tracker.observe(&status, &snapshot) {
                if let Err(e) = logger.log_event(
                    status.timestamp_us,
                    timebase.unix_us(),
                    event_type,
                    details,
                ) {
                    warn!(error = %e, "Failed to write audit entry");
                }
            }
        }
    })
}
