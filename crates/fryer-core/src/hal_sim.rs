use crate::hal::{BasketPosition, Command, PortOpener, SerialIo};
use crate::sync::lock;
use crate::timebase::Clock;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Most recent commands kept for inspection.
const SENT_HISTORY: usize = 1024;

/// Simulated fryer with oil thermal dynamics, speaking the serial protocol.
#[derive(Debug, Clone)]
struct SimState {
    oil_temp_c: f64,
    ambient_temp_c: f64,
    heat_rate_c_per_s: f64,
    cooling_coeff: f64,
    elements: [bool; 2],
    basket: BasketPosition,
    last_update: Duration,

    sent: VecDeque<Command>,
    write_attempts: u64,
    pending_lines: VecDeque<String>,

    refuse_open: bool,
    fail_writes: bool,
    garbage_telemetry: bool,
}

#[derive(Clone)]
pub struct SimulatedFryer {
    state: Arc<Mutex<SimState>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedFryer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Arc::new(Mutex::new(SimState {
                oil_temp_c: 25.0,
                ambient_temp_c: 25.0,
                heat_rate_c_per_s: 1.0,
                cooling_coeff: 0.004,
                elements: [false; 2],
                basket: BasketPosition::Raised,
                last_update: now,
                sent: VecDeque::with_capacity(64),
                write_attempts: 0,
                pending_lines: VecDeque::new(),
                refuse_open: false,
                fail_writes: false,
                garbage_telemetry: false,
            })),
            clock,
        }
    }

    pub fn with_oil_temperature(self, celsius: f64) -> Self {
        lock(&self.state).oil_temp_c = celsius;
        self
    }

    pub fn set_refuse_open(&self, refuse: bool) {
        lock(&self.state).refuse_open = refuse;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn set_garbage_telemetry(&self, garbage: bool) {
        lock(&self.state).garbage_telemetry = garbage;
    }

    /// Queues a raw line to be returned by the next read.
    pub fn push_line(&self, line: &str) {
        lock(&self.state).pending_lines.push_back(line.to_string());
    }

    /// The last commands applied, oldest first.
    pub fn sent_commands(&self) -> Vec<Command> {
        lock(&self.state).sent.iter().copied().collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    pub fn write_attempts(&self) -> u64 {
        lock(&self.state).write_attempts
    }

    pub fn oil_temperature(&self) -> f64 {
        let mut state = lock(&self.state);
        Self::step(&mut state, self.clock.now());
        state.oil_temp_c
    }

    pub fn elements(&self) -> [bool; 2] {
        lock(&self.state).elements
    }

    pub fn basket(&self) -> BasketPosition {
        lock(&self.state).basket
    }

    fn step(state: &mut SimState, now: Duration) {
        let dt_s = now.saturating_sub(state.last_update).as_secs_f64();
        state.last_update = now;
        if dt_s <= 0.0 {
            return;
        }

        // Heat input per energized element, Newton cooling toward ambient.
        let powered = state.elements.iter().filter(|on| **on).count() as f64;
        let equilibrium =
            state.ambient_temp_c + powered * state.heat_rate_c_per_s / state.cooling_coeff;
        let decay = (-state.cooling_coeff * dt_s).exp();
        state.oil_temp_c = equilibrium + (state.oil_temp_c - equilibrium) * decay;
    }

    fn apply(state: &mut SimState, command: Command) {
        match command {
            Command::HeatingOn => state.elements = [true; 2],
            Command::HeatingOff => state.elements = [false; 2],
            Command::RaiseBasket => state.basket = BasketPosition::Raised,
            Command::LowerBasket => state.basket = BasketPosition::Lowered,
            Command::Element { element, on } => state.elements[element.index()] = on,
        }
        if state.sent.len() == SENT_HISTORY {
            state.sent.pop_front();
        }
        state.sent.push_back(command);
    }
}

impl PortOpener for SimulatedFryer {
    fn open(&self) -> io::Result<Box<dyn SerialIo>> {
        if lock(&self.state).refuse_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "simulated port unavailable",
            ));
        }
        Ok(Box::new(SimulatedPort {
            fryer: self.clone(),
        }))
    }

    fn describe(&self) -> String {
        "simulated fryer".to_string()
    }
}

struct SimulatedPort {
    fryer: SimulatedFryer,
}

impl SerialIo for SimulatedPort {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = lock(&self.fryer.state);
        state.write_attempts += 1;
        if state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            ));
        }
        let now = self.fryer.clock.now();
        SimulatedFryer::step(&mut state, now);
        if let Some(command) = Command::from_wire(line) {
            SimulatedFryer::apply(&mut state, command);
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut state = lock(&self.fryer.state);
        if let Some(line) = state.pending_lines.pop_front() {
            return Ok(Some(line));
        }
        if state.garbage_telemetry {
            return Ok(Some("ERR sensor open".to_string()));
        }
        let now = self.fryer.clock.now();
        SimulatedFryer::step(&mut state, now);
        Ok(Some(format!("Temp: {:.1}°C", state.oil_temp_c)))
    }
}
