use crate::hal::Command;
use crate::heating::HeatingController;
use crate::link::SerialLink;
use crate::sync::lock;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Latched emergency-stop interlock. Once set, only an explicit `clear`
/// releases it; every start request is refused until then.
#[derive(Debug, Default)]
pub struct EmergencyStop {
    latched: AtomicBool,
    trips: AtomicU64,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call latched it.
    pub fn latch(&self) -> bool {
        let first = !self.latched.swap(true, Ordering::SeqCst);
        if first {
            self.trips.fetch_add(1, Ordering::Relaxed);
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    /// Returns `true` if it was latched.
    pub fn clear(&self) -> bool {
        self.latched.swap(false, Ordering::SeqCst)
    }

    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafeStateReport {
    pub heating_off_sent: bool,
    pub raise_sent: bool,
}

/// Heating off, then one best-effort basket raise. Send failures are logged
/// and reported, never propagated.
pub fn drive_safe_state(link: &SerialLink, heating: &Mutex<HeatingController>) -> SafeStateReport {
    let heating_off_sent = match lock(heating).force_off(link) {
        Ok(_) => true,
        Err(e) => {
            error!("Safe state: heating-off failed: {}", e);
            false
        }
    };
    let raise_sent = match link.send(Command::RaiseBasket) {
        Ok(_) => true,
        Err(e) => {
            warn!("Safe state: basket raise failed: {}", e);
            false
        }
    };
    info!(
        "Safe state driven (heating_off_sent={}, raise_sent={})",
        heating_off_sent, raise_sent
    );
    SafeStateReport {
        heating_off_sent,
        raise_sent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::BasketPosition;
    use crate::hal_sim::SimulatedFryer;
    use crate::link::LinkConfig;
    use crate::timebase::ManualClock;
    use std::sync::Arc;

    #[test]
    fn latch_is_idempotent_until_cleared() {
        let estop = EmergencyStop::new();
        assert!(estop.latch());
        assert!(!estop.latch());
        assert!(estop.is_triggered());
        assert_eq!(estop.trip_count(), 1);

        assert!(estop.clear());
        assert!(!estop.clear());
        assert!(!estop.is_triggered());
    }

    #[test]
    fn safe_state_sends_heating_off_then_raise() {
        let clock = Arc::new(ManualClock::new());
        let sim = SimulatedFryer::new(clock.clone());
        let link = SerialLink::open(Box::new(sim.clone()), LinkConfig::default(), clock);
        let heating = Mutex::new(HeatingController::new(2.0));
        lock(&heating).set_demand(180.0);

        let report = drive_safe_state(&link, &heating);

        assert!(report.heating_off_sent && report.raise_sent);
        assert_eq!(
            sim.sent_commands(),
            vec![Command::HeatingOff, Command::RaiseBasket]
        );
        assert!(!lock(&heating).is_active());
        assert_eq!(link.basket_position(), BasketPosition::Raised);
    }

    #[test]
    fn safe_state_with_link_down_reports_failures() {
        let clock = Arc::new(ManualClock::new());
        let sim = SimulatedFryer::new(clock.clone());
        sim.set_refuse_open(true);
        let link = SerialLink::open(Box::new(sim), LinkConfig::default(), clock);
        let heating = Mutex::new(HeatingController::new(2.0));

        let report = drive_safe_state(&link, &heating);
        assert!(!report.heating_off_sent);
        assert!(!report.raise_sent);
        assert!(!lock(&heating).state().any_on());
    }
}
