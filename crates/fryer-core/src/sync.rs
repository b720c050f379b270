use crate::fry_cycle::{FryJob, FryPhase};
use crate::hal::BasketPosition;
use crate::heating::HeatingState;
use crate::link::{LinkHealth, LinkStats};
use crate::temperature::Temperature;
use log::{info, warn};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Every guarded value here is a plain snapshot, so a panicked writer cannot
// leave it half-updated in a way later readers care about.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the operator sees: phase, a human message and optional progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStatus {
    pub phase: FryPhase,
    pub message: String,
    /// 0.0..=1.0 while a phase has a measurable end.
    pub progress: Option<f32>,
    pub timestamp_us: u64,
    /// Label of the job this status belongs to. Outlives the snapshot's job
    /// slot, which is cleared as soon as a cycle ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

impl CycleStatus {
    pub fn new(
        phase: FryPhase,
        message: impl Into<String>,
        progress: Option<f32>,
        timestamp_us: u64,
    ) -> Self {
        Self {
            phase,
            message: message.into(),
            progress,
            timestamp_us,
            job: None,
        }
    }

    pub fn for_job(mut self, label: impl Into<String>) -> Self {
        self.job = Some(label.into());
        self
    }

    pub fn idle(timestamp_us: u64) -> Self {
        Self::new(FryPhase::Idle, "Ready", None, timestamp_us)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleCounters {
    pub cycles_completed: u64,
    pub cycles_aborted: u64,
    pub emergency_stops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FryerSnapshot {
    pub timestamp_us: u64,
    pub tick_count: u64,
    pub temperature_c: f64,
    pub target_c: Option<f64>,
    pub heating: HeatingState,
    pub basket: BasketPosition,
    pub link: LinkHealth,
    pub link_stats: LinkStats,
    pub parse_failures: u64,
    pub emergency_latched: bool,
    pub status: CycleStatus,
    pub job: Option<FryJob>,
    pub counters: CycleCounters,
}

impl FryerSnapshot {
    fn new(initial_temperature_c: f64) -> Self {
        Self {
            timestamp_us: 0,
            tick_count: 0,
            temperature_c: Temperature::new(initial_temperature_c).celsius(),
            target_c: None,
            heating: HeatingState::OFF,
            basket: BasketPosition::Unknown,
            link: LinkHealth::Disconnected,
            link_stats: LinkStats::default(),
            parse_failures: 0,
            emergency_latched: false,
            status: CycleStatus::idle(0),
            job: None,
            counters: CycleCounters::default(),
        }
    }
}

/// Shared state between the tick loop, the fry cycle worker and outside
/// readers (bridge, metrics).
///
/// Created once by the controller and dropped with it. Status events are
/// broadcast to subscribers in the order they were applied to the snapshot.
pub struct StateExchange {
    snapshot: RwLock<FryerSnapshot>,
    subscribers: Mutex<Vec<Sender<CycleStatus>>>,
}

impl StateExchange {
    pub fn new(initial_temperature_c: f64) -> Self {
        Self {
            snapshot: RwLock::new(FryerSnapshot::new(initial_temperature_c)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn read_state(&self) -> FryerSnapshot {
        read(&self.snapshot).clone()
    }

    pub fn status(&self) -> CycleStatus {
        read(&self.snapshot).status.clone()
    }

    pub fn phase(&self) -> FryPhase {
        read(&self.snapshot).status.phase
    }

    pub fn temperature(&self) -> Temperature {
        Temperature::new(read(&self.snapshot).temperature_c)
    }

    pub fn update(&self, apply: impl FnOnce(&mut FryerSnapshot)) {
        apply(&mut write(&self.snapshot));
    }

    pub fn publish_status(&self, status: CycleStatus) -> bool {
        self.publish_status_if(status, |_| true)
    }

    /// Publishes `status` if `allow` accepts the current snapshot and the
    /// phase change is a legal transition. Both checks run under the write
    /// lock, so a concurrent publisher cannot slip in between.
    pub fn publish_status_if(
        &self,
        status: CycleStatus,
        allow: impl FnOnce(&FryerSnapshot) -> bool,
    ) -> bool {
        let mut snapshot = write(&self.snapshot);
        if !allow(&snapshot) {
            return false;
        }
        let from = snapshot.status.phase;
        if !from.can_transition_to(status.phase) {
            warn!("Ignoring illegal phase change {} -> {}", from, status.phase);
            return false;
        }
        if from != status.phase {
            info!("Fry phase {} -> {}: {}", from, status.phase, status.message);
        }
        snapshot.status = status.clone();

        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(status.clone()).is_ok());
        true
    }

    pub fn begin_job(&self, job: FryJob) {
        let mut snapshot = write(&self.snapshot);
        snapshot.target_c = Some(job.target_c());
        snapshot.job = Some(job);
    }

    pub fn clear_job(&self) {
        write(&self.snapshot).job = None;
    }

    /// Status events from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<CycleStatus> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}
