//! One fry run: heat the oil, lower the basket, count down, raise the basket.
//!
//! The cycle runs on its own worker thread. Heating regulation itself stays
//! in the tick loop; the cycle only watches the published temperature, drives
//! the basket and reports progress through the [`StateExchange`].

use crate::basket::BasketActuator;
use crate::emergency::{drive_safe_state, EmergencyStop};
use crate::error::{ActuatorError, StartError};
use crate::heating::HeatingController;
use crate::link::SerialLink;
use crate::sync::{lock, CycleStatus, StateExchange};
use crate::timebase::{sleep_unless_aborted, Clock};
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FryPhase {
    #[default]
    Idle,
    Heating,
    LoweringBasket,
    Frying,
    RaisingBasket,
    Done,
    Aborted,
}

impl FryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FryPhase::Idle => "idle",
            FryPhase::Heating => "heating",
            FryPhase::LoweringBasket => "lowering_basket",
            FryPhase::Frying => "frying",
            FryPhase::RaisingBasket => "raising_basket",
            FryPhase::Done => "done",
            FryPhase::Aborted => "aborted",
        }
    }

    /// Numeric code for the phase gauge.
    pub fn code(&self) -> i64 {
        match self {
            FryPhase::Idle => 0,
            FryPhase::Heating => 1,
            FryPhase::LoweringBasket => 2,
            FryPhase::Frying => 3,
            FryPhase::RaisingBasket => 4,
            FryPhase::Done => 5,
            FryPhase::Aborted => 6,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            FryPhase::Heating | FryPhase::LoweringBasket | FryPhase::Frying | FryPhase::RaisingBasket
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FryPhase::Done | FryPhase::Aborted)
    }

    /// Re-publishing the same phase (progress refresh) is always allowed.
    pub fn can_transition_to(&self, next: FryPhase) -> bool {
        use FryPhase::*;
        if *self == next || next == Aborted {
            return true;
        }
        matches!(
            (self, next),
            (Idle | Done | Aborted, Heating)
                | (Done | Aborted, Idle)
                | (Heating, LoweringBasket)
                | (LoweringBasket, Frying)
                | (Frying, RaisingBasket)
                | (RaisingBasket, Done)
        )
    }
}

impl fmt::Display for FryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounds applied to operator input before a job exists.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLimits {
    pub min_target_c: f64,
    pub max_target_c: f64,
    pub min_duration_s: u32,
    pub max_duration_s: u32,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            min_target_c: 100.0,
            max_target_c: 250.0,
            min_duration_s: 30,
            max_duration_s: 600,
        }
    }
}

/// A validated fry request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FryJob {
    label: String,
    target_c: f64,
    duration_s: u32,
}

impl FryJob {
    pub fn new(
        label: impl Into<String>,
        target_c: f64,
        duration_s: u32,
        limits: &JobLimits,
    ) -> Result<Self, StartError> {
        if !target_c.is_finite() || target_c < limits.min_target_c || target_c > limits.max_target_c
        {
            return Err(StartError::TargetOutOfRange {
                requested: target_c,
                min: limits.min_target_c,
                max: limits.max_target_c,
            });
        }
        if duration_s < limits.min_duration_s || duration_s > limits.max_duration_s {
            return Err(StartError::DurationOutOfRange {
                requested: duration_s,
                min: limits.min_duration_s,
                max: limits.max_duration_s,
            });
        }
        Ok(Self {
            label: label.into(),
            target_c,
            duration_s,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target_c(&self) -> f64 {
        self.target_c
    }

    pub fn duration_s(&self) -> u32 {
        self.duration_s
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_s))
    }
}

#[derive(Debug, Clone)]
pub struct CycleTiming {
    /// Lower the basket once the oil is within this many °C of the target.
    pub lower_band_c: f64,
    pub heating_poll: Duration,
    pub countdown_poll: Duration,
    pub abort_poll: Duration,
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            lower_band_c: 5.0,
            heating_poll: Duration::from_secs(1),
            countdown_poll: Duration::from_secs(1),
            abort_poll: Duration::from_millis(100),
        }
    }
}

/// Everything a cycle worker borrows from the controller.
pub struct CycleContext {
    pub link: Arc<SerialLink>,
    pub heating: Arc<Mutex<HeatingController>>,
    pub basket: BasketActuator,
    pub exchange: Arc<StateExchange>,
    pub emergency: Arc<EmergencyStop>,
    pub clock: Arc<dyn Clock>,
    pub timing: CycleTiming,
    pub abort: Arc<AtomicBool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed,
    Aborted { reason: String },
}

#[derive(Debug)]
enum Interrupt {
    Abort,
    Actuator(ActuatorError),
}

impl From<ActuatorError> for Interrupt {
    fn from(err: ActuatorError) -> Self {
        match err {
            ActuatorError::Aborted { .. } => Interrupt::Abort,
            other => Interrupt::Actuator(other),
        }
    }
}

pub struct FryCycle {
    job: FryJob,
    ctx: CycleContext,
}

impl FryCycle {
    pub fn new(job: FryJob, ctx: CycleContext) -> Self {
        Self { job, ctx }
    }

    pub fn job(&self) -> &FryJob {
        &self.job
    }

    /// Runs the cycle to completion or interruption. Never panics on device
    /// errors; the outcome says how it ended.
    pub fn run(self) -> CycleOutcome {
        info!(
            "Fry cycle '{}' started: {:.0}°C for {}s",
            self.job.label, self.job.target_c, self.job.duration_s
        );
        let outcome = match self.drive() {
            Ok(()) => {
                self.ctx.exchange.update(|s| s.counters.cycles_completed += 1);
                CycleOutcome::Completed
            }
            Err(interrupt) => self.interrupted(interrupt),
        };
        self.ctx.exchange.clear_job();
        outcome
    }

    fn drive(&self) -> Result<(), Interrupt> {
        self.heat()?;

        self.publish(FryPhase::LoweringBasket, "Lowering basket", None);
        self.ctx.basket.lower(&self.ctx.abort)?;

        self.fry()?;

        self.publish(FryPhase::RaisingBasket, "Raising basket", Some(1.0));
        if let Err(e) = lock(&self.ctx.heating).force_off(&self.ctx.link) {
            warn!("Heating-off on basket raise failed: {}", e);
        }
        self.ctx.basket.raise(&self.ctx.abort)?;

        self.publish(
            FryPhase::Done,
            format!("Done: {}", self.job.label),
            Some(1.0),
        );
        info!("Fry cycle '{}' complete", self.job.label);
        Ok(())
    }

    fn heat(&self) -> Result<(), Interrupt> {
        let target = self.job.target_c;
        let threshold = target - self.ctx.timing.lower_band_c;
        loop {
            self.check_abort()?;
            let current = self.ctx.exchange.temperature().celsius();
            if current >= threshold {
                return Ok(());
            }
            let progress = (current / threshold).clamp(0.0, 1.0) as f32;
            self.publish(
                FryPhase::Heating,
                format!("Heating oil: {:.1}°C / {:.0}°C", current, target),
                Some(progress),
            );
            self.wait(self.ctx.timing.heating_poll)?;
        }
    }

    fn fry(&self) -> Result<(), Interrupt> {
        let total = self.job.duration();
        let started = self.ctx.clock.now();
        self.publish(FryPhase::Frying, self.countdown(total), Some(0.0));

        loop {
            let elapsed = self.ctx.clock.now().saturating_sub(started);
            if elapsed >= total {
                return Ok(());
            }
            self.wait(self.ctx.timing.countdown_poll.min(total - elapsed))?;

            let elapsed = self.ctx.clock.now().saturating_sub(started).min(total);
            let progress = elapsed.as_secs_f64() / total.as_secs_f64().max(f64::EPSILON);
            self.publish(
                FryPhase::Frying,
                self.countdown(total - elapsed),
                Some(progress as f32),
            );
        }
    }

    fn countdown(&self, remaining: Duration) -> String {
        let secs = remaining.as_secs_f64().ceil() as u64;
        format!(
            "Frying {}: {:02}:{:02} remaining",
            self.job.label,
            secs / 60,
            secs % 60
        )
    }

    fn interrupted(&self, interrupt: Interrupt) -> CycleOutcome {
        let reason = match interrupt {
            Interrupt::Abort if self.ctx.emergency.is_triggered() => {
                // The emergency stop already drove the safe state and published.
                info!("Fry cycle '{}' stopped by emergency stop", self.job.label);
                "emergency stop".to_string()
            }
            Interrupt::Abort => {
                drive_safe_state(&self.ctx.link, &self.ctx.heating);
                self.publish(FryPhase::Aborted, "Fry cycle aborted", None);
                "aborted".to_string()
            }
            Interrupt::Actuator(err) => {
                error!("Fry cycle '{}' basket fault: {}", self.job.label, err);
                let first = self.ctx.emergency.latch();
                drive_safe_state(&self.ctx.link, &self.ctx.heating);
                let heating = lock(&self.ctx.heating).state();
                self.ctx.exchange.update(|s| {
                    s.emergency_latched = true;
                    s.heating = heating;
                    if first {
                        s.counters.emergency_stops += 1;
                    }
                });
                let message = format!("Basket fault: {}; emergency stop latched", err);
                self.ctx.exchange.publish_status(
                    CycleStatus::new(
                        FryPhase::Aborted,
                        message.clone(),
                        None,
                        self.ctx.clock.now_us(),
                    )
                    .for_job(self.job.label()),
                );
                message
            }
        };
        self.ctx.exchange.update(|s| s.counters.cycles_aborted += 1);
        CycleOutcome::Aborted { reason }
    }

    /// Drops non-abort updates once the emergency stop has latched.
    fn publish(&self, phase: FryPhase, message: impl Into<String>, progress: Option<f32>) {
        let status = CycleStatus::new(phase, message, progress, self.ctx.clock.now_us())
            .for_job(self.job.label());
        let emergency = &self.ctx.emergency;
        self.ctx.exchange.publish_status_if(status, |_| {
            phase == FryPhase::Aborted || !emergency.is_triggered()
        });
    }

    fn check_abort(&self) -> Result<(), Interrupt> {
        if self.ctx.abort.load(Ordering::SeqCst) {
            Err(Interrupt::Abort)
        } else {
            Ok(())
        }
    }

    fn wait(&self, duration: Duration) -> Result<(), Interrupt> {
        let completed = sleep_unless_aborted(
            self.ctx.clock.as_ref(),
            duration,
            self.ctx.timing.abort_poll,
            &self.ctx.abort,
        );
        if completed {
            Ok(())
        } else {
            Err(Interrupt::Abort)
        }
    }
}
