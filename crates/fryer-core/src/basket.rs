use crate::error::{ActuatorError, LinkError};
use crate::hal::{BasketPosition, Command};
use crate::link::SerialLink;
use crate::timebase::{sleep_unless_aborted, Clock};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ActuatorTiming {
    /// How long the lift takes end to end. The command is held for the whole window.
    pub window: Duration,
    pub resend_interval: Duration,
    pub abort_poll: Duration,
}

impl Default for ActuatorTiming {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            resend_interval: Duration::from_secs(1),
            abort_poll: Duration::from_millis(100),
        }
    }
}

/// Drives the basket lift. There is no end-stop feedback: a move counts as
/// done when the full window passed with every resend accepted by the link.
pub struct BasketActuator {
    link: Arc<SerialLink>,
    clock: Arc<dyn Clock>,
    timing: ActuatorTiming,
}

impl BasketActuator {
    pub fn new(link: Arc<SerialLink>, clock: Arc<dyn Clock>, timing: ActuatorTiming) -> Self {
        Self {
            link,
            clock,
            timing,
        }
    }

    pub fn lower(&self, abort: &AtomicBool) -> Result<(), ActuatorError> {
        self.actuate(Command::LowerBasket, abort)
    }

    pub fn raise(&self, abort: &AtomicBool) -> Result<(), ActuatorError> {
        self.actuate(Command::RaiseBasket, abort)
    }

    pub fn position(&self) -> BasketPosition {
        self.link.basket_position()
    }

    fn actuate(&self, command: Command, abort: &AtomicBool) -> Result<(), ActuatorError> {
        if !self.link.is_connected() {
            warn!("Cannot start {}: serial link down", command);
            return Err(ActuatorError::LinkUnavailable { command });
        }

        let window = self.timing.window;
        let started = self.clock.now();
        let mut sends = 0u32;
        info!("Basket {} started ({}s window)", command, window.as_secs());

        loop {
            if abort.load(Ordering::SeqCst) {
                return Err(ActuatorError::Aborted { command });
            }
            match self.link.send_unless(command, abort) {
                Ok(_) => sends += 1,
                Err(LinkError::Cancelled { .. }) => {
                    return Err(ActuatorError::Aborted { command });
                }
                Err(source) => {
                    warn!("Basket {} failed after {} sends: {}", command, sends, source);
                    return Err(ActuatorError::SendFailed { command, source });
                }
            }

            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed >= window {
                break;
            }
            let wait = self.timing.resend_interval.min(window - elapsed);
            if !sleep_unless_aborted(self.clock.as_ref(), wait, self.timing.abort_poll, abort) {
                return Err(ActuatorError::Aborted { command });
            }
            if self.clock.now().saturating_sub(started) >= window {
                break;
            }
        }

        info!("Basket {} complete ({} sends)", command, sends);
        Ok(())
    }
}
