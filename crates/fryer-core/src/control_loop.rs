use crate::basket::{ActuatorTiming, BasketActuator};
use crate::emergency::{drive_safe_state, EmergencyStop};
use crate::error::StartError;
use crate::fry_cycle::{
    CycleContext, CycleOutcome, CycleTiming, FryCycle, FryJob, FryPhase, JobLimits,
};
use crate::hal::PortOpener;
use crate::heating::{HeatingController, HeatingState};
use crate::link::{LinkConfig, PortSettings, SerialLink};
use crate::sync::{lock, CycleStatus, FryerSnapshot, StateExchange};
use crate::temperature::{Temperature, TemperatureReader};
use crate::timebase::Clock;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct FryerConfig {
    pub port: PortSettings,
    pub link: LinkConfig,
    pub limits: JobLimits,
    pub cycle: CycleTiming,
    pub actuator: ActuatorTiming,
    pub hysteresis_c: f64,
    pub tick_interval: Duration,
    pub reconnect_interval: Duration,
    pub sim_step_c: f64,
    pub ambient_c: f64,
    pub default_target_c: f64,
}

impl Default for FryerConfig {
    fn default() -> Self {
        Self {
            port: PortSettings::default(),
            link: LinkConfig::default(),
            limits: JobLimits::default(),
            cycle: CycleTiming::default(),
            actuator: ActuatorTiming::default(),
            hysteresis_c: 2.0,
            tick_interval: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(5),
            sim_step_c: 0.1,
            ambient_c: 25.0,
            default_target_c: 180.0,
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct TickStats {
    pub ticks: u64,
    pub overruns: u64,
    pub max_jitter_us: u64,
    pub last_jitter_us: u64,
    pub reconnect_attempts: u64,
}

struct ActiveCycle {
    label: String,
    abort: Arc<AtomicBool>,
    handle: JoinHandle<CycleOutcome>,
}

/// Process-wide owner of the fryer: the serial link, the regulation state,
/// the shared snapshot and at most one fry cycle worker.
///
/// `run` drives the periodic tick on the caller's thread. Every other method
/// may be called from any thread.
pub struct FryerController {
    config: FryerConfig,
    clock: Arc<dyn Clock>,
    link: Arc<SerialLink>,
    reader: Mutex<TemperatureReader>,
    heating: Arc<Mutex<HeatingController>>,
    exchange: Arc<StateExchange>,
    emergency: Arc<EmergencyStop>,
    cycle: Mutex<Option<ActiveCycle>>,
    stats: Mutex<TickStats>,
    last_reconnect: Mutex<Duration>,
}

impl FryerController {
    pub fn new(opener: Box<dyn PortOpener>, config: FryerConfig, clock: Arc<dyn Clock>) -> Self {
        let link = Arc::new(SerialLink::open(opener, config.link.clone(), clock.clone()));
        let reader = TemperatureReader::new(config.ambient_c, config.sim_step_c);
        let heating = HeatingController::new(config.hysteresis_c);
        let exchange = Arc::new(StateExchange::new(config.ambient_c));
        exchange.update(|s| {
            s.link = link.health();
            s.basket = link.basket_position();
        });
        let now = clock.now();

        Self {
            link,
            reader: Mutex::new(reader),
            heating: Arc::new(Mutex::new(heating)),
            exchange,
            emergency: Arc::new(EmergencyStop::new()),
            cycle: Mutex::new(None),
            stats: Mutex::new(TickStats::default()),
            last_reconnect: Mutex::new(now),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &FryerConfig {
        &self.config
    }

    pub fn exchange(&self) -> Arc<StateExchange> {
        Arc::clone(&self.exchange)
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    pub fn status(&self) -> CycleStatus {
        self.exchange.status()
    }

    pub fn snapshot(&self) -> FryerSnapshot {
        self.exchange.read_state()
    }

    pub fn subscribe(&self) -> Receiver<CycleStatus> {
        self.exchange.subscribe()
    }

    pub fn heating_state(&self) -> HeatingState {
        lock(&self.heating).state()
    }

    pub fn temperature(&self) -> Temperature {
        lock(&self.reader).current()
    }

    pub fn is_emergency_latched(&self) -> bool {
        self.emergency.is_triggered()
    }

    pub fn stats(&self) -> TickStats {
        *lock(&self.stats)
    }

    /// One control period: reconnect if due, read telemetry, regulate heat,
    /// publish the snapshot.
    pub fn tick(&self) {
        self.maybe_reconnect();

        let heating_active = lock(&self.heating).is_active();
        let (temperature, parse_failures) = {
            let mut reader = lock(&self.reader);
            let temperature = reader.poll(&self.link, heating_active);
            (temperature, reader.parse_failures())
        };
        let (heating, target_c) = {
            let mut heating = lock(&self.heating);
            let state = heating.regulate(&self.link, temperature, self.config.default_target_c);
            (state, heating.demand())
        };

        let tick_count = {
            let mut stats = lock(&self.stats);
            stats.ticks += 1;
            stats.ticks
        };
        let timestamp_us = self.clock.now_us();
        let latched = self.emergency.is_triggered();
        self.exchange.update(|s| {
            s.timestamp_us = timestamp_us;
            s.tick_count = tick_count;
            s.temperature_c = temperature.celsius();
            s.target_c = target_c.or(s.job.as_ref().map(FryJob::target_c));
            s.heating = heating;
            s.basket = self.link.basket_position();
            s.link = self.link.health();
            s.link_stats = self.link.stats();
            s.parse_failures = parse_failures;
            s.emergency_latched = latched;
        });
        debug!(
            "tick {}: {:.1}°C heating=({}, {})",
            tick_count,
            temperature.celsius(),
            heating.element1,
            heating.element2
        );
    }

    fn maybe_reconnect(&self) {
        if self.link.is_connected() {
            return;
        }
        let now = self.clock.now();
        {
            let mut last = lock(&self.last_reconnect);
            if now.saturating_sub(*last) < self.config.reconnect_interval {
                return;
            }
            *last = now;
        }
        lock(&self.stats).reconnect_attempts += 1;
        if let Err(e) = self.link.reconnect() {
            debug!("Reconnect failed: {}", e);
        }
    }

    /// Ticks at `tick_interval` until `stop` is set. A tick more than one
    /// interval late counts as an overrun and the schedule restarts from now.
    pub fn run(&self, stop: &AtomicBool) {
        let interval = self.config.tick_interval;
        let mut next_tick = self.clock.now();
        info!("Control loop running every {:?}", interval);

        while !stop.load(Ordering::Relaxed) {
            let now = self.clock.now();
            if now < next_tick {
                self.clock.sleep(next_tick - now);
            } else {
                let late = now - next_tick;
                let jitter_us = late.as_micros() as u64;
                let mut stats = lock(&self.stats);
                stats.last_jitter_us = jitter_us;
                stats.max_jitter_us = stats.max_jitter_us.max(jitter_us);
                if late > interval {
                    stats.overruns += 1;
                    next_tick = now;
                }
            }

            self.tick();
            next_tick += interval;
        }
        info!("Control loop stopped");
    }

    pub fn start(&self, label: &str, target_c: f64, duration_s: u32) -> Result<(), StartError> {
        let job = FryJob::new(label, target_c, duration_s, &self.config.limits)?;
        self.start_job(job)
    }

    /// Accepts a validated job and spawns its cycle worker. The Heating
    /// status is visible before this returns.
    pub fn start_job(&self, job: FryJob) -> Result<(), StartError> {
        if self.emergency.is_triggered() {
            return Err(StartError::EmergencyLatched);
        }
        let mut slot = lock(&self.cycle);
        // Re-check under the slot lock; the emergency path latches before taking it.
        if self.emergency.is_triggered() {
            return Err(StartError::EmergencyLatched);
        }
        if let Some(active) = slot.take() {
            if !active.handle.is_finished() {
                let label = active.label.clone();
                *slot = Some(active);
                return Err(StartError::JobConflict { active: label });
            }
            reap(active);
        }

        lock(&self.heating).set_demand(job.target_c());
        self.exchange.begin_job(job.clone());
        let emergency = Arc::clone(&self.emergency);
        self.exchange.publish_status_if(
            CycleStatus::new(
                FryPhase::Heating,
                format!("Heating to {:.0}°C for {}", job.target_c(), job.label()),
                Some(0.0),
                self.clock.now_us(),
            )
            .for_job(job.label()),
            |_| !emergency.is_triggered(),
        );

        let abort = Arc::new(AtomicBool::new(false));
        let ctx = CycleContext {
            link: Arc::clone(&self.link),
            heating: Arc::clone(&self.heating),
            basket: BasketActuator::new(
                Arc::clone(&self.link),
                Arc::clone(&self.clock),
                self.config.actuator.clone(),
            ),
            exchange: Arc::clone(&self.exchange),
            emergency,
            clock: Arc::clone(&self.clock),
            timing: self.config.cycle.clone(),
            abort: Arc::clone(&abort),
        };
        let label = job.label().to_string();
        let cycle = FryCycle::new(job, ctx);
        let handle = thread::Builder::new()
            .name("fry-cycle".to_string())
            .spawn(move || cycle.run());

        match handle {
            Ok(handle) => {
                *slot = Some(ActiveCycle {
                    label,
                    abort,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to spawn fry cycle: {}", e);
                lock(&self.heating).force_off(&self.link).ok();
                self.exchange.clear_job();
                self.exchange.publish_status(
                    CycleStatus::new(
                        FryPhase::Aborted,
                        "Fry cycle could not start",
                        None,
                        self.clock.now_us(),
                    )
                    .for_job(label),
                );
                Err(StartError::WorkerSpawn {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Blocks until the current cycle worker (if any) finishes.
    pub fn wait_for_cycle(&self) -> Option<CycleOutcome> {
        loop {
            {
                let mut slot = lock(&self.cycle);
                match slot.as_ref() {
                    None => return None,
                    Some(active) if active.handle.is_finished() => {
                        return slot.take().and_then(reap);
                    }
                    Some(_) => {}
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Latches the interlock, aborts the running cycle and drives the safe
    /// state. Repeated calls re-send the safe-state commands. Returns `true`
    /// when this call latched it.
    pub fn trigger_emergency_stop(&self) -> bool {
        let first = self.emergency.latch();
        if first {
            warn!("Emergency stop triggered");
        }
        let job = lock(&self.cycle).as_ref().and_then(|active| {
            active.abort.store(true, Ordering::SeqCst);
            (!active.handle.is_finished()).then(|| active.label.clone())
        });

        drive_safe_state(&self.link, &self.heating);

        let heating = lock(&self.heating).state();
        self.exchange.update(|s| {
            s.emergency_latched = true;
            s.heating = heating;
            s.basket = self.link.basket_position();
            if first {
                s.counters.emergency_stops += 1;
            }
        });
        let mut status = CycleStatus::new(
            FryPhase::Aborted,
            "Emergency stop activated",
            None,
            self.clock.now_us(),
        );
        status.job = job;
        self.exchange.publish_status(status);
        first
    }

    /// Waits for the aborted worker to exit, releases the interlock and
    /// returns to Idle. The basket is not moved. Returns `false` if nothing
    /// was latched.
    pub fn reset_emergency_stop(&self) -> bool {
        if !self.emergency.is_triggered() {
            return false;
        }
        {
            let mut slot = lock(&self.cycle);
            if let Some(active) = slot.take() {
                active.abort.store(true, Ordering::SeqCst);
                reap(active);
            }
            self.emergency.clear();
        }
        self.exchange.clear_job();
        self.exchange.update(|s| s.emergency_latched = false);
        self.exchange.publish_status(CycleStatus::idle(self.clock.now_us()));
        info!("Emergency stop reset");
        true
    }

    /// Stops any running cycle and leaves the fryer with heat off and the
    /// basket up. Called once on process exit.
    pub fn shutdown(&self) {
        if let Some(active) = lock(&self.cycle).take() {
            active.abort.store(true, Ordering::SeqCst);
            reap(active);
        }
        drive_safe_state(&self.link, &self.heating);
        self.link.disconnect();
        info!("Fryer controller shut down");
    }
}

fn reap(active: ActiveCycle) -> Option<CycleOutcome> {
    match active.handle.join() {
        Ok(outcome) => Some(outcome),
        Err(_) => {
            warn!("Fry cycle worker '{}' panicked", active.label);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BasketPosition, Command};
    use crate::hal_sim::SimulatedFryer;
    use crate::timebase::{ManualClock, TimeBase};

    fn manual_controller(oil_c: f64) -> (Arc<ManualClock>, SimulatedFryer, FryerController) {
        let clock = Arc::new(ManualClock::new());
        let sim = SimulatedFryer::new(clock.clone()).with_oil_temperature(oil_c);
        let controller =
            FryerController::new(Box::new(sim.clone()), FryerConfig::default(), clock.clone());
        (clock, sim, controller)
    }

    /// Real clock, short windows: for tests that must act mid-phase.
    fn fast_controller(oil_c: f64) -> (SimulatedFryer, FryerController) {
        let clock: Arc<dyn Clock> = Arc::new(TimeBase::new());
        let sim = SimulatedFryer::new(clock.clone()).with_oil_temperature(oil_c);
        let config = FryerConfig {
            link: LinkConfig {
                retries: 2,
                command_delay: Duration::from_millis(1),
            },
            limits: JobLimits {
                min_duration_s: 1,
                ..JobLimits::default()
            },
            cycle: CycleTiming {
                heating_poll: Duration::from_millis(20),
                countdown_poll: Duration::from_millis(50),
                abort_poll: Duration::from_millis(5),
                ..CycleTiming::default()
            },
            actuator: ActuatorTiming {
                window: Duration::from_millis(400),
                resend_interval: Duration::from_millis(50),
                abort_poll: Duration::from_millis(5),
            },
            ..FryerConfig::default()
        };
        let controller = FryerController::new(Box::new(sim.clone()), config, clock);
        (sim, controller)
    }

    fn phases_in_order(rx: &Receiver<CycleStatus>) -> Vec<FryPhase> {
        let mut phases: Vec<FryPhase> = Vec::new();
        for status in rx.try_iter() {
            if phases.last() != Some(&status.phase) {
                phases.push(status.phase);
            }
        }
        phases
    }

    #[test]
    fn tick_publishes_temperature_and_link_health() {
        let (_clock, _sim, controller) = manual_controller(120.0);
        controller.tick();
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.temperature_c, 120.0);
        assert_eq!(snapshot.tick_count, 1);
        assert_eq!(snapshot.heating, HeatingState::OFF);
        assert_eq!(snapshot.status.phase, FryPhase::Idle);
    }

    #[test]
    fn full_cycle_visits_every_phase_and_fries_for_duration() {
        let (_clock, sim, controller) = manual_controller(172.0);
        controller.tick();
        let rx = controller.subscribe();

        controller.start("fries", 170.0, 90).unwrap();
        let outcome = controller.wait_for_cycle();
        assert_eq!(outcome, Some(CycleOutcome::Completed));

        let events: Vec<CycleStatus> = rx.try_iter().collect();
        let mut phases: Vec<FryPhase> = Vec::new();
        for status in &events {
            if phases.last() != Some(&status.phase) {
                phases.push(status.phase);
            }
        }
        assert_eq!(
            phases,
            [
                FryPhase::Heating,
                FryPhase::LoweringBasket,
                FryPhase::Frying,
                FryPhase::RaisingBasket,
                FryPhase::Done
            ]
        );
        assert!(events.iter().all(|s| s.job.as_deref() == Some("fries")));
        assert!(controller.snapshot().job.is_none());

        let first = |phase: FryPhase| {
            events
                .iter()
                .find(|s| s.phase == phase)
                .map(|s| s.timestamp_us)
                .unwrap()
        };
        let fried_us = first(FryPhase::RaisingBasket) - first(FryPhase::Frying);
        assert!(
            fried_us.abs_diff(90_000_000) <= 1_000_000,
            "fried for {fried_us}us"
        );

        let sent = sim.sent_commands();
        assert!(sent.contains(&Command::LowerBasket));
        assert!(sent.contains(&Command::HeatingOff));
        assert_eq!(sent.last(), Some(&Command::RaiseBasket));
        assert_eq!(controller.link().basket_position(), BasketPosition::Raised);
        assert_eq!(controller.heating_state(), HeatingState::OFF);

        let snapshot = controller.snapshot();
        assert!(snapshot.job.is_none());
        assert_eq!(snapshot.counters.cycles_completed, 1);
    }

    #[test]
    fn second_start_conflicts_and_leaves_first_job_running() {
        // Cold oil and no tick loop: the first job stays in Heating.
        let (_clock, _sim, controller) = manual_controller(25.0);
        controller.start("fries", 180.0, 120).unwrap();

        let err = controller.start("wings", 175.0, 200).unwrap_err();
        assert_eq!(
            err,
            StartError::JobConflict {
                active: "fries".to_string()
            }
        );
        assert_eq!(err.code(), "job_conflict");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status.phase, FryPhase::Heating);
        assert_eq!(snapshot.job.as_ref().map(FryJob::label), Some("fries"));

        controller.trigger_emergency_stop();
        controller.reset_emergency_stop();
    }

    #[test]
    fn invalid_input_is_rejected_without_side_effects() {
        let (_clock, sim, controller) = manual_controller(25.0);
        assert!(matches!(
            controller.start("fries", 300.0, 120),
            Err(StartError::TargetOutOfRange { .. })
        ));
        assert_eq!(controller.status().phase, FryPhase::Idle);
        assert!(sim.sent_commands().is_empty());
        assert!(controller.wait_for_cycle().is_none());
    }

    #[test]
    fn emergency_stop_during_heating_latches_until_reset() {
        let (_clock, sim, controller) = manual_controller(25.0);
        controller.start("fries", 180.0, 120).unwrap();
        controller.tick();
        assert!(controller.heating_state().any_on());

        assert!(controller.trigger_emergency_stop());
        assert!(!controller.trigger_emergency_stop());

        assert_eq!(controller.heating_state(), HeatingState::OFF);
        assert_eq!(sim.elements(), [false, false]);
        assert_eq!(sim.sent_commands().last(), Some(&Command::RaiseBasket));
        let status = controller.status();
        assert_eq!(status.phase, FryPhase::Aborted);
        assert_eq!(status.message, "Emergency stop activated");

        assert_eq!(
            controller.start("fries", 180.0, 120),
            Err(StartError::EmergencyLatched)
        );

        assert!(controller.reset_emergency_stop());
        assert_eq!(controller.status().phase, FryPhase::Idle);
        assert!(!controller.is_emergency_latched());
        assert_eq!(controller.snapshot().counters.emergency_stops, 1);
        controller.start("fries", 180.0, 120).unwrap();
        controller.trigger_emergency_stop();
        controller.reset_emergency_stop();
    }

    #[test]
    fn emergency_stop_in_each_running_phase_reaches_safe_state() {
        for phase in [
            FryPhase::Heating,
            FryPhase::LoweringBasket,
            FryPhase::Frying,
            FryPhase::RaisingBasket,
        ] {
            let oil = if phase == FryPhase::Heating { 25.0 } else { 178.0 };
            let (sim, controller) = fast_controller(oil);
            controller.tick();
            let rx = controller.subscribe();
            controller.start("fries", 180.0, 1).unwrap();

            let reached = rx
                .iter()
                .any(|status| status.phase == phase || status.phase.is_terminal());
            assert!(reached);
            assert_ne!(controller.status().phase, FryPhase::Done, "{phase} never seen");

            controller.trigger_emergency_stop();
            let outcome = controller.wait_for_cycle();
            assert!(
                matches!(outcome, Some(CycleOutcome::Aborted { .. })),
                "{phase}: {outcome:?}"
            );

            assert_eq!(controller.status().phase, FryPhase::Aborted, "{phase}");
            assert_eq!(controller.heating_state(), HeatingState::OFF);
            assert_eq!(sim.elements(), [false, false]);
            assert_eq!(sim.basket(), BasketPosition::Raised, "{phase}");
            assert_eq!(
                controller.start("fries", 180.0, 1),
                Err(StartError::EmergencyLatched)
            );
            assert!(controller.reset_emergency_stop());
            assert_eq!(controller.status().phase, FryPhase::Idle);
        }
    }

    #[test]
    fn basket_fault_aborts_and_latches_emergency_stop() {
        let (_clock, sim, controller) = manual_controller(178.0);
        controller.tick();
        sim.set_fail_writes(true);

        controller.start("fries", 180.0, 60).unwrap();
        let outcome = controller.wait_for_cycle();
        assert!(matches!(outcome, Some(CycleOutcome::Aborted { .. })));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status.phase, FryPhase::Aborted);
        assert!(snapshot.status.message.starts_with("Basket fault"));
        assert!(snapshot.emergency_latched);
        assert_eq!(snapshot.counters.cycles_aborted, 1);
        assert_eq!(
            controller.start("fries", 180.0, 60),
            Err(StartError::EmergencyLatched)
        );
        assert!(controller.reset_emergency_stop());
    }

    #[test]
    fn basket_fault_with_link_down_reports_link_unavailable() {
        let (_clock, sim, controller) = manual_controller(178.0);
        controller.tick();
        controller.link().disconnect();
        sim.set_refuse_open(true);
        let rx = controller.subscribe();

        controller.start("fries", 180.0, 60).unwrap();
        controller.wait_for_cycle();
        let phases = phases_in_order(&rx);
        assert_eq!(
            phases,
            [FryPhase::Heating, FryPhase::LoweringBasket, FryPhase::Aborted]
        );
        assert!(controller.status().message.contains("unavailable"));
    }

    #[test]
    fn start_after_done_is_accepted() {
        let (_clock, _sim, controller) = manual_controller(178.0);
        controller.tick();
        controller.start("fries", 180.0, 30).unwrap();
        assert_eq!(controller.wait_for_cycle(), Some(CycleOutcome::Completed));
        assert_eq!(controller.status().phase, FryPhase::Done);

        controller.start("wings", 180.0, 30).unwrap();
        assert_eq!(controller.wait_for_cycle(), Some(CycleOutcome::Completed));
    }

    #[test]
    fn reconnect_is_attempted_on_interval() {
        let (clock, _sim, controller) = manual_controller(25.0);
        controller.link().disconnect();
        controller.tick();
        assert!(!controller.link().is_connected());

        clock.advance(Duration::from_secs(5));
        controller.tick();
        assert!(controller.link().is_connected());
        assert_eq!(controller.stats().reconnect_attempts, 1);
    }

    #[test]
    fn shutdown_sends_cleanup_commands() {
        let (_clock, sim, controller) = manual_controller(25.0);
        controller.start("fries", 180.0, 120).unwrap();
        controller.shutdown();
        let sent = sim.sent_commands();
        assert_eq!(
            sent[sent.len() - 2..],
            [Command::HeatingOff, Command::RaiseBasket]
        );
        assert!(!controller.link().is_connected());
    }
}
