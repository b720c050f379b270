pub mod basket;
pub mod control_loop;
pub mod emergency;
pub mod error;
pub mod fry_cycle;
pub mod hal;
pub mod hal_sim;
pub mod heating;
pub mod link;
pub mod sync;
pub mod tags;
pub mod temperature;
pub mod timebase;

pub use basket::{ActuatorTiming, BasketActuator};
pub use control_loop::{FryerConfig, FryerController, TickStats};
pub use emergency::{drive_safe_state, EmergencyStop, SafeStateReport};
pub use error::{ActuatorError, LinkError, ParseError, StartError};
pub use fry_cycle::{CycleOutcome, CycleTiming, FryCycle, FryJob, FryPhase, JobLimits};
pub use hal::{BasketPosition, Command, Element, PortOpener, SerialIo};
pub use hal_sim::SimulatedFryer;
pub use heating::{HeatingController, HeatingState};
pub use link::{Ack, LinkConfig, LinkHealth, LinkStats, PortSettings, SerialLink};
pub use sync::{CycleCounters, CycleStatus, FryerSnapshot, StateExchange};
pub use temperature::{parse_telemetry, Temperature, TemperatureReader, MAX_TEMP_C, MIN_TEMP_C};
pub use timebase::{Clock, ManualClock, TimeBase};
