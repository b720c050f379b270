use crate::metrics::{BRIDGE_CONNECTED, BRIDGE_REJECTED};
use crate::protocol::{AckMsg, ErrorMsg, HelloMsg, IncomingMessage, StatusMsg};
use fryer_core::{CycleStatus, FryerController, TimeBase};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    pub require_handshake: bool,
    /// A client that lets this much output queue up is dropped.
    pub max_outbox: usize,
    /// A client that sends more than this without a newline is dropped.
    pub max_line: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            publish_interval: Duration::from_millis(500),
            require_handshake: false,
            max_outbox: 64 * 1024,
            max_line: 4096,
        }
    }
}

#[derive(Debug, Default)]
struct InboundState {
    handshake_seen: bool,
    client_id: Option<String>,
}

impl InboundState {
    fn reset(&mut self) {
        *self = InboundState::default();
    }

    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.client_id = hello.client_id.clone();
    }
}

#[derive(Debug, PartialEq)]
struct LineTooLong(usize);

/// Splits inbound bytes into trimmed, non-empty lines.
struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
}

impl LineBuffer {
    fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line.min(4096)),
            max_line,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        if self.buf.len() > self.max_line {
            let len = self.buf.len();
            self.buf.clear();
            return Err(LineTooLong(len));
        }
        Ok(lines)
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug)]
enum Reply {
    Ack(&'static str),
    Error(ErrorMsg),
    Status,
}

/// Outgoing newline-delimited JSON, written as far as the socket accepts.
#[derive(Default)]
struct Outbox {
    buf: Vec<u8>,
    sequence: u64,
}

impl Outbox {
    fn push<T: Serialize>(&mut self, msg: &T) {
        match serde_json::to_vec(msg) {
            Ok(line) => {
                self.buf.extend_from_slice(&line);
                self.buf.push(b'\n');
            }
            Err(e) => warn!(error = %e, "Failed to encode bridge message"),
        }
    }

    fn push_status(&mut self, controller: &FryerController, timebase: &TimeBase, event: Option<CycleStatus>) {
        self.sequence = self.sequence.wrapping_add(1);
        let snapshot = controller.snapshot();
        let mut msg = StatusMsg::from_snapshot(&snapshot, self.sequence, timebase.unix_us());
        if let Some(event) = event {
            msg.phase = event.phase.as_str();
            msg.message = event.message;
            msg.progress = event.progress;
            msg.timestamp_us = event.timestamp_us;
            if event.job.is_some() {
                msg.job = event.job;
            }
        }
        self.push(&msg);
    }

    /// Returns `false` if the peer is gone.
    fn flush_to(&mut self, stream: &mut TcpStream) -> bool {
        while !self.buf.is_empty() {
            match stream.write(&self.buf) {
                Ok(0) => return false,
                Ok(n) => {
                    self.buf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) => {
                    warn!(error = %err, "Bridge write error");
                    return false;
                }
            }
        }
        true
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Serves one operator client at a time until `stop` is set.
///
/// The client receives a status line every `publish_interval` and one per
/// cycle status event, plus an `ack` or `error` for every command line.
pub fn run_bridge(
    controller: Arc<FryerController>,
    timebase: TimeBase,
    config: BridgeConfig,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr)?;
    listener.set_nonblocking(true)?;
    info!(
        addr = %config.bind_addr,
        require_handshake = config.require_handshake,
        "Bridge listening"
    );

    let events = controller.subscribe();
    let mut client: Option<TcpStream> = None;
    let mut recv_buf = LineBuffer::new(config.max_line);
    let mut outbox = Outbox::default();
    let mut last_publish = Instant::now();
    let mut inbound_state = InboundState::default();

    while !stop.load(Ordering::Relaxed) {
        if client.is_none() {
            match listener.accept() {
                Ok((stream, addr)) => match stream.set_nonblocking(true) {
                    Ok(()) => {
                        info!(client_addr = %addr, "Bridge client connected");
                        client = Some(stream);
                        BRIDGE_CONNECTED.set(1.0);
                        // Greet with the current state right away.
                        outbox.push_status(&controller, &timebase, None);
                        last_publish = Instant::now();
                    }
                    Err(e) => warn!(error = %e, "Failed to configure bridge client"),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => warn!("Bridge accept error: {}", err),
            }
        }

        let mut drop_client = false;
        let mut hang_up = false;
        if let Some(stream) = client.as_mut() {
            let mut temp = [0u8; 1024];
            match stream.read(&mut temp) {
                Ok(0) => {
                    info!("Bridge client disconnected");
                    drop_client = true;
                }
                Ok(n) => match recv_buf.feed(&temp[..n]) {
                    Ok(lines) => {
                        for line in lines {
                            match handle_line(
                                &line,
                                &controller,
                                config.require_handshake,
                                &mut inbound_state,
                            ) {
                                Reply::Ack(command) => outbox.push(&AckMsg::new(command)),
                                Reply::Error(err) => {
                                    BRIDGE_REJECTED.inc();
                                    outbox.push(&err);
                                }
                                Reply::Status => {
                                    outbox.push_status(&controller, &timebase, None)
                                }
                            }
                        }
                    }
                    Err(LineTooLong(len)) => {
                        warn!(buffered = len, "Bridge line too long; dropping client");
                        BRIDGE_REJECTED.inc();
                        outbox.push(&ErrorMsg::new(
                            None,
                            "bad_request",
                            format!("line exceeds {} bytes", config.max_line),
                        ));
                        hang_up = true;
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(error = %err, "Bridge read error");
                    drop_client = true;
                }
            }

            for event in events.try_iter() {
                outbox.push_status(&controller, &timebase, Some(event));
            }
            if last_publish.elapsed() >= config.publish_interval {
                outbox.push_status(&controller, &timebase, None);
                last_publish = Instant::now();
            }

            if !drop_client && !outbox.flush_to(stream) {
                info!("Bridge client disconnected");
                drop_client = true;
            }
            if outbox.buf.len() > config.max_outbox {
                warn!(queued = outbox.buf.len(), "Bridge client too slow; dropping");
                drop_client = true;
            }
            drop_client |= hang_up;
        } else {
            // Nobody to tell.
            events.try_iter().for_each(drop);
        }

        if drop_client {
            client = None;
            recv_buf.clear();
            outbox.clear();
            inbound_state.reset();
            BRIDGE_CONNECTED.set(0.0);
        }

        std::thread::sleep(Duration::from_millis(5));
    }
    info!("Bridge stopped");
    Ok(())
}

fn handle_line(
    line: &str,
    controller: &FryerController,
    require_handshake: bool,
    inbound_state: &mut InboundState,
) -> Reply {
    let msg = match IncomingMessage::parse(line) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Rejected bridge message");
            return Reply::Error(ErrorMsg::new(None, e.code(), e.to_string()));
        }
    };
    let command = msg.command();
    let version = msg.protocol_version();
    if !version.is_supported() {
        warn!(
            major = version.major,
            minor = version.minor,
            "Unsupported protocol version"
        );
        return Reply::Error(ErrorMsg::new(
            Some(command),
            "unsupported_version",
            format!("protocol {}.{} not supported", version.major, version.minor),
        ));
    }

    match msg {
        IncomingMessage::Hello(hello) => {
            inbound_state.note_handshake(&hello);
            info!(
                client_id = ?hello.client_id,
                capabilities = ?hello.capabilities,
                "Bridge handshake received"
            );
            Reply::Ack(command)
        }
        _ if require_handshake && !inbound_state.handshake_seen => {
            warn!(command, "Command received before handshake");
            Reply::Error(ErrorMsg::new(
                Some(command),
                "handshake_required",
                "send hello first",
            ))
        }
        IncomingMessage::Start(start) => {
            match controller.start(&start.label, start.target_c, start.duration_s) {
                Ok(()) => {
                    info!(
                        label = %start.label,
                        target_c = start.target_c,
                        duration_s = start.duration_s,
                        client_id = ?inbound_state.client_id,
                        "Fry job started from bridge"
                    );
                    Reply::Ack(command)
                }
                Err(e) => {
                    warn!(error = %e, "Fry job rejected");
                    Reply::Error(ErrorMsg::rejected_start(&e))
                }
            }
        }
        IncomingMessage::EmergencyStop(_) => {
            warn!(client_id = ?inbound_state.client_id, "Emergency stop requested from bridge");
            controller.trigger_emergency_stop();
            Reply::Ack(command)
        }
        IncomingMessage::Reset(_) => {
            if controller.reset_emergency_stop() {
                Reply::Ack(command)
            } else {
                Reply::Error(ErrorMsg::new(
                    Some(command),
                    "not_latched",
                    "emergency stop is not latched",
                ))
            }
        }
        IncomingMessage::Status(_) => {
            debug!("Status requested");
            Reply::Status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fryer_core::{Clock, FryPhase, FryerConfig, SimulatedFryer};

    fn controller() -> FryerController {
        let clock: Arc<dyn Clock> = Arc::new(TimeBase::new());
        let sim = SimulatedFryer::new(clock.clone());
        FryerController::new(Box::new(sim), FryerConfig::default(), clock)
    }

    #[test]
    fn line_buffer_reassembles_split_lines() {
        let mut lines = LineBuffer::new(64);
        assert_eq!(lines.feed(b"{\"type\":").unwrap(), Vec::<String>::new());
        assert_eq!(
            lines.feed(b"\"status\"}\r\n\n  \n{\"type\"").unwrap(),
            [r#"{"type":"status"}"#]
        );
        assert_eq!(lines.feed(b":\"reset\"}\n").unwrap(), [r#"{"type":"reset"}"#]);
    }

    #[test]
    fn unterminated_flood_is_cut_off() {
        let mut lines = LineBuffer::new(4096);
        let chunk = [b'x'; 1024];
        for _ in 0..4 {
            assert!(lines.feed(&chunk).unwrap().is_empty());
        }
        assert_eq!(lines.feed(&chunk), Err(LineTooLong(5 * 1024)));
        assert!(lines.buf.is_empty());

        // Only the unterminated remainder counts.
        let mut long = vec![b'y'; 5000];
        long.push(b'\n');
        let mut lines = LineBuffer::new(4096);
        assert_eq!(lines.feed(&long).unwrap().len(), 1);
    }

    fn code(reply: &Reply) -> Option<&'static str> {
        match reply {
            Reply::Error(err) => Some(err.code),
            _ => None,
        }
    }

    #[test]
    fn start_then_conflict_then_estop_and_reset() {
        let controller = controller();
        let mut state = InboundState::default();
        let start = r#"{"type":"start","label":"fries","target_c":180,"duration_s":120}"#;

        assert!(matches!(
            handle_line(start, &controller, false, &mut state),
            Reply::Ack("start")
        ));
        let reply = handle_line(start, &controller, false, &mut state);
        assert_eq!(code(&reply), Some("job_conflict"));

        assert!(matches!(
            handle_line(r#"{"type":"emergency_stop"}"#, &controller, false, &mut state),
            Reply::Ack("emergency_stop")
        ));
        assert_eq!(controller.status().phase, FryPhase::Aborted);
        let reply = handle_line(start, &controller, false, &mut state);
        assert_eq!(code(&reply), Some("emergency_latched"));

        assert!(matches!(
            handle_line(r#"{"type":"reset"}"#, &controller, false, &mut state),
            Reply::Ack("reset")
        ));
        let reply = handle_line(r#"{"type":"reset"}"#, &controller, false, &mut state);
        assert_eq!(code(&reply), Some("not_latched"));
    }

    #[test]
    fn out_of_range_start_is_reported() {
        let controller = controller();
        let mut state = InboundState::default();
        let reply = handle_line(
            r#"{"type":"start","label":"fries","target_c":400,"duration_s":120}"#,
            &controller,
            false,
            &mut state,
        );
        assert_eq!(code(&reply), Some("input_range"));
        assert_eq!(controller.status().phase, FryPhase::Idle);
    }

    #[test]
    fn handshake_gate() {
        let controller = controller();
        let mut state = InboundState::default();
        let reply = handle_line(r#"{"type":"status"}"#, &controller, true, &mut state);
        assert_eq!(code(&reply), Some("handshake_required"));

        let hello = r#"{"type":"hello","protocol_version":{"major":1,"minor":0},"client_id":"panel"}"#;
        assert!(matches!(
            handle_line(hello, &controller, true, &mut state),
            Reply::Ack("hello")
        ));
        assert_eq!(state.client_id.as_deref(), Some("panel"));
        assert!(matches!(
            handle_line(r#"{"type":"status"}"#, &controller, true, &mut state),
            Reply::Status
        ));
    }

    #[test]
    fn malformed_lines_get_error_replies() {
        let controller = controller();
        let mut state = InboundState::default();
        let reply = handle_line("not json", &controller, false, &mut state);
        assert_eq!(code(&reply), Some("bad_request"));
        let reply = handle_line(r#"{"type":"fly"}"#, &controller, false, &mut state);
        assert_eq!(code(&reply), Some("unknown_type"));
        let reply = handle_line(
            r#"{"type":"status","protocol_version":{"major":2,"minor":0}}"#,
            &controller,
            false,
            &mut state,
        );
        assert_eq!(code(&reply), Some("unsupported_version"));
    }
}
