use crate::error::LinkError;
use crate::hal::{Command, Element};
use crate::link::{Ack, SerialLink};
use crate::temperature::Temperature;
use log::{debug, info, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeatingState {
    pub element1: bool,
    pub element2: bool,
}

impl HeatingState {
    pub const OFF: HeatingState = HeatingState {
        element1: false,
        element2: false,
    };

    pub fn get(&self, element: Element) -> bool {
        match element {
            Element::One => self.element1,
            Element::Two => self.element2,
        }
    }

    fn set(&mut self, element: Element, on: bool) {
        match element {
            Element::One => self.element1 = on,
            Element::Two => self.element2 = on,
        }
    }

    pub fn any_on(&self) -> bool {
        self.element1 || self.element2
    }
}

/// On/off regulation of both elements with a symmetric hysteresis band.
///
/// The controller only records an element as switched after the link
/// accepted the command. It also owns the heating demand (the target while a
/// job needs heat), so the tick path and the fry cycle decide under one lock.
#[derive(Debug)]
pub struct HeatingController {
    state: HeatingState,
    hysteresis_c: f64,
    demand_c: Option<f64>,
    off_pending: bool,
}

impl HeatingController {
    pub fn new(hysteresis_c: f64) -> Self {
        Self {
            state: HeatingState::OFF,
            hysteresis_c,
            demand_c: None,
            off_pending: false,
        }
    }

    pub fn state(&self) -> HeatingState {
        self.state
    }

    pub fn demand(&self) -> Option<f64> {
        self.demand_c
    }

    pub fn is_active(&self) -> bool {
        self.demand_c.is_some()
    }

    pub fn set_demand(&mut self, target_c: f64) {
        self.demand_c = Some(target_c);
    }

    /// `Some(on)` when both elements should be switched, `None` to hold.
    pub fn decide(&self, current: Temperature, target: Temperature, active: bool) -> Option<bool> {
        if !active {
            return Some(false);
        }
        let current = current.celsius();
        let target = target.celsius();
        if current < target - self.hysteresis_c {
            Some(true)
        } else if current > target + self.hysteresis_c {
            Some(false)
        } else {
            None
        }
    }

    /// One regulation step. Sends one command per element whose state changes.
    pub fn tick(
        &mut self,
        link: &SerialLink,
        current: Temperature,
        target: Temperature,
        active: bool,
    ) -> HeatingState {
        if self.off_pending {
            self.retry_off(link);
        }

        let Some(on) = self.decide(current, target, active) else {
            return self.state;
        };

        for element in Element::ALL {
            if self.state.get(element) == on {
                continue;
            }
            match link.send(Command::Element { element, on }) {
                Ok(_) => {
                    self.state.set(element, on);
                    debug!(
                        "Element {:?} {} at {:.1}°C (target {:.1}°C)",
                        element,
                        if on { "on" } else { "off" },
                        current.celsius(),
                        target.celsius()
                    );
                }
                Err(e) => {
                    // Physical state unknown; keep the last confirmed value.
                    warn!(
                        "Element {:?} still {} after failed switch: {}",
                        element,
                        if self.state.get(element) { "on" } else { "off" },
                        e
                    );
                }
            }
        }
        self.state
    }

    /// Regulates against the stored demand; without demand both elements go off.
    pub fn regulate(
        &mut self,
        link: &SerialLink,
        current: Temperature,
        idle_target_c: f64,
    ) -> HeatingState {
        let (target_c, active) = match self.demand_c {
            Some(target_c) => (target_c, true),
            None => (idle_target_c, false),
        };
        self.tick(link, current, Temperature::new(target_c), active)
    }

    /// Drops the demand and sends the combined heating-off command. The state
    /// reads (off, off) from here on; if the send failed it is repeated on
    /// every tick until acknowledged.
    pub fn force_off(&mut self, link: &SerialLink) -> Result<Ack, LinkError> {
        self.demand_c = None;
        self.state = HeatingState::OFF;
        match link.send(Command::HeatingOff) {
            Ok(ack) => {
                self.off_pending = false;
                info!("Heating forced off");
                Ok(ack)
            }
            Err(e) => {
                self.off_pending = true;
                warn!("Heating-off not acknowledged, will retry: {}", e);
                Err(e)
            }
        }
    }

    fn retry_off(&mut self, link: &SerialLink) {
        if link.send(Command::HeatingOff).is_ok() {
            self.off_pending = false;
            info!("Pending heating-off acknowledged");
        }
    }
}
