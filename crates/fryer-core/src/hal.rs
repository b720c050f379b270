use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// One of the two induction heating elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Element {
    One,
    Two,
}

impl Element {
    pub const ALL: [Element; 2] = [Element::One, Element::Two];

    pub fn index(self) -> usize {
        match self {
            Element::One => 0,
            Element::Two => 1,
        }
    }
}

/// Commands understood by the fryer microcontroller.
///
/// Wire format is one ASCII token per line: `1` heating on, `2` heating off,
/// `3` basket up, `4` basket down, and `H1_ON`/`H1_OFF`/`H2_ON`/`H2_OFF` for
/// the individual elements.
///
/// Regulation only switches elements one at a time with the `H1_*`/`H2_*`
/// tokens; `1` stays in the vocabulary for boards and manual tools that use
/// it, and the simulator honours it. Heating is always stopped with `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    HeatingOn,
    HeatingOff,
    RaiseBasket,
    LowerBasket,
    Element { element: Element, on: bool },
}

impl Command {
    pub fn wire(self) -> &'static str {
        match self {
            Command::HeatingOn => "1",
            Command::HeatingOff => "2",
            Command::RaiseBasket => "3",
            Command::LowerBasket => "4",
            Command::Element {
                element: Element::One,
                on: true,
            } => "H1_ON",
            Command::Element {
                element: Element::One,
                on: false,
            } => "H1_OFF",
            Command::Element {
                element: Element::Two,
                on: true,
            } => "H2_ON",
            Command::Element {
                element: Element::Two,
                on: false,
            } => "H2_OFF",
        }
    }

    pub fn from_wire(token: &str) -> Option<Self> {
        let command = match token.trim() {
            "1" => Command::HeatingOn,
            "2" => Command::HeatingOff,
            "3" => Command::RaiseBasket,
            "4" => Command::LowerBasket,
            "H1_ON" => Command::Element {
                element: Element::One,
                on: true,
            },
            "H1_OFF" => Command::Element {
                element: Element::One,
                on: false,
            },
            "H2_ON" => Command::Element {
                element: Element::Two,
                on: true,
            },
            "H2_OFF" => Command::Element {
                element: Element::Two,
                on: false,
            },
            _ => return None,
        };
        Some(command)
    }

    /// Basket position implied by a successful send of this command.
    pub fn basket_effect(self) -> Option<BasketPosition> {
        match self {
            Command::RaiseBasket => Some(BasketPosition::Raised),
            Command::LowerBasket => Some(BasketPosition::Lowered),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::HeatingOn => "heating-on",
            Command::HeatingOff => "heating-off",
            Command::RaiseBasket => "basket-raise",
            Command::LowerBasket => "basket-lower",
            Command::Element { .. } => self.wire(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasketPosition {
    Raised,
    Lowered,
    #[default]
    Unknown,
}

impl BasketPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BasketPosition::Raised => "raised",
            BasketPosition::Lowered => "lowered",
            BasketPosition::Unknown => "unknown",
        }
    }
}

/// An open, line-oriented connection to the fryer microcontroller.
pub trait SerialIo: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// `Ok(None)` when no complete line arrived within the port's read timeout.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Opens (and re-opens) the physical port.
pub trait PortOpener: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn SerialIo>>;
    fn describe(&self) -> String;
}
