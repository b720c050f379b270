//! Physical serial port behind the core's `PortOpener` seam.

use fryer_core::{PortOpener, PortSettings, SerialIo};
use std::io::{self, Read, Write};
use tracing::debug;

/// Longest partial line kept while waiting for a newline.
const MAX_PENDING: usize = 4096;

pub struct SerialPortOpener {
    settings: PortSettings,
}

impl SerialPortOpener {
    pub fn new(settings: PortSettings) -> Self {
        Self { settings }
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self) -> io::Result<Box<dyn SerialIo>> {
        let port = serialport::new(&self.settings.path, self.settings.baud)
            .timeout(self.settings.read_timeout)
            .open()?;
        debug!(
            path = %self.settings.path,
            baud = self.settings.baud,
            "Serial port opened"
        );
        Ok(Box::new(LineIo::new(port)))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.settings.path, self.settings.baud)
    }
}

/// Newline framing over any byte stream with a read timeout.
pub struct LineIo<P> {
    port: P,
    pending: Vec<u8>,
}

impl<P> LineIo<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            pending: Vec::with_capacity(256),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(decode_line(&raw).trim().to_string())
    }
}

/// Latin-1 degree sign as some boards send it.
const LATIN1_DEGREE: u8 = 0xB0;

/// UTF-8 decode that keeps a Latin-1 `°` and drops any other invalid bytes.
fn decode_line(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                if invalid.first() == Some(&LATIN1_DEGREE) {
                    out.push('°');
                }
                let skip = e.error_len().unwrap_or(invalid.len());
                rest = &invalid[skip..];
            }
        }
    }
}

impl<P: Read + Write + Send> SerialIo for LineIo<P> {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                if self.pending.len() > MAX_PENDING && !self.pending.contains(&b'\n') {
                    self.pending.clear();
                }
                Ok(self.take_line())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
