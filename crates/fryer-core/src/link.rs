//! Serial transport to the fryer microcontroller.
//!
//! Every command is written as one line, flushed, and followed by a fixed
//! processing delay during which the port stays locked, so commands from the
//! heating path, the basket actuator and the emergency stop never interleave.
//!
//! The protocol has no position feedback, so the link layer itself records the
//! basket position implied by each successful basket command. Callers must not
//! assume a position change unless their `send` returned `Ok`.

use crate::error::LinkError;
use crate::hal::{BasketPosition, Command, PortOpener, SerialIo};
use crate::sync::lock;
use crate::timebase::Clock;
use log::{debug, info, warn};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    Connected,
    #[default]
    Disconnected,
}

impl LinkHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkHealth::Connected => "connected",
            LinkHealth::Disconnected => "disconnected",
        }
    }
}

/// Acknowledgement of a completed write. The peer sends no reply, so this
/// only means the bytes left the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub command: Command,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub retries: u32,
    pub command_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retries: 4,
            command_delay: Duration::from_millis(100),
        }
    }
}

/// Where the physical port lives. Consumed by the serial opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub path: String,
    pub baud: u32,
    pub read_timeout: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            path: "/dev/serial0".to_string(),
            baud: 9600,
            read_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkStats {
    pub commands_sent: u64,
    pub send_failures: u64,
    pub reconnects: u64,
}

enum AttemptError {
    NotConnected,
    Cancelled,
    Io(io::Error),
}

pub struct SerialLink {
    opener: Box<dyn PortOpener>,
    config: LinkConfig,
    clock: Arc<dyn Clock>,
    port: Mutex<Option<Box<dyn SerialIo>>>,
    basket: Mutex<BasketPosition>,
    stats: Mutex<LinkStats>,
}

impl SerialLink {
    /// Creates the link and tries to open the port once. An open failure is
    /// logged and leaves the link disconnected.
    pub fn open(opener: Box<dyn PortOpener>, config: LinkConfig, clock: Arc<dyn Clock>) -> Self {
        let link = Self {
            opener,
            config,
            clock,
            port: Mutex::new(None),
            basket: Mutex::new(BasketPosition::Unknown),
            stats: Mutex::new(LinkStats::default()),
        };
        if let Err(e) = link.reconnect() {
            warn!("{}; continuing with simulated temperature", e);
        }
        link
    }

    pub fn reconnect(&self) -> Result<(), LinkError> {
        match self.opener.open() {
            Ok(port) => {
                *lock(&self.port) = Some(port);
                lock(&self.stats).reconnects += 1;
                info!("Serial link connected to {}", self.opener.describe());
                Ok(())
            }
            Err(source) => {
                *lock(&self.port) = None;
                Err(LinkError::Open {
                    port: self.opener.describe(),
                    source,
                })
            }
        }
    }

    pub fn disconnect(&self) {
        if lock(&self.port).take().is_some() {
            info!("Serial link to {} closed", self.opener.describe());
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.port).is_some()
    }

    pub fn health(&self) -> LinkHealth {
        if self.is_connected() {
            LinkHealth::Connected
        } else {
            LinkHealth::Disconnected
        }
    }

    pub fn describe(&self) -> String {
        self.opener.describe()
    }

    /// Sends one command, retrying failed writes up to the configured count
    /// with a fixed delay between attempts. Exhausting the retries drops the
    /// port; it stays down until `reconnect` succeeds.
    pub fn send(&self, command: Command) -> Result<Ack, LinkError> {
        self.send_inner(command, None)
    }

    /// Like `send`, but `cancel` is checked while the port is held, so a
    /// caller that sets it before sending its own command is guaranteed this
    /// one is either already on the wire or never written.
    pub fn send_unless(&self, command: Command, cancel: &AtomicBool) -> Result<Ack, LinkError> {
        self.send_inner(command, Some(cancel))
    }

    fn send_inner(&self, command: Command, cancel: Option<&AtomicBool>) -> Result<Ack, LinkError> {
        let attempts = self.config.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.clock.sleep(self.config.command_delay);
            }
            match self.write_attempt(command, cancel) {
                Ok(()) => {
                    debug!("Sent {} (attempt {}/{})", command, attempt, attempts);
                    lock(&self.stats).commands_sent += 1;
                    self.record_basket(command, true);
                    return Ok(Ack { command, attempt });
                }
                Err(AttemptError::Cancelled) => {
                    debug!("{} cancelled before write", command);
                    return Err(LinkError::Cancelled { command });
                }
                Err(AttemptError::NotConnected) => {
                    lock(&self.stats).send_failures += 1;
                    self.record_basket(command, false);
                    return Err(LinkError::NotConnected);
                }
                Err(AttemptError::Io(e)) => {
                    warn!(
                        "Serial write failed for {} (attempt {}/{}): {}",
                        command, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.disconnect();
        lock(&self.stats).send_failures += 1;
        self.record_basket(command, false);
        Err(LinkError::RetriesExhausted {
            command,
            attempts,
            source: last_error.unwrap_or_else(|| io::Error::other("no write attempted")),
        })
    }

    fn write_attempt(
        &self,
        command: Command,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), AttemptError> {
        let mut guard = lock(&self.port);
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(AttemptError::Cancelled);
        }
        let port = guard.as_mut().ok_or(AttemptError::NotConnected)?;
        port.write_line(command.wire())
            .and_then(|_| port.flush())
            .map_err(AttemptError::Io)?;
        // The peer needs this long to process a command; keep the port.
        self.clock.sleep(self.config.command_delay);
        Ok(())
    }

    fn record_basket(&self, command: Command, succeeded: bool) {
        if let Some(position) = command.basket_effect() {
            let mut basket = lock(&self.basket);
            *basket = if succeeded {
                position
            } else {
                BasketPosition::Unknown
            };
        }
    }

    /// Reads one telemetry line. A read error drops the port.
    pub fn read_line(&self) -> Option<String> {
        let mut guard = lock(&self.port);
        let port = guard.as_mut()?;
        match port.read_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Serial read failed: {}; link marked disconnected", e);
                *guard = None;
                None
            }
        }
    }

    pub fn basket_position(&self) -> BasketPosition {
        *lock(&self.basket)
    }

    pub fn stats(&self) -> LinkStats {
        *lock(&self.stats)
    }
}
