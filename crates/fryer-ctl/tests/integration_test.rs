use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

struct FryerProcess {
    child: Child,
    addr: String,
}

impl FryerProcess {
    fn start(extra_args: &[&str]) -> Self {
        // Prefer the test-built binary when available to avoid extra cargo builds.
        let bin_path = std::env::var("CARGO_BIN_EXE_fryer-ctl").unwrap_or_else(|_| {
            let candidates = [
                "../../target/release/fryer-ctl",
                "target/release/fryer-ctl",
                "./target/release/fryer-ctl",
                "../../target/debug/fryer-ctl",
                "target/debug/fryer-ctl",
                "./target/debug/fryer-ctl",
            ];
            for candidate in candidates {
                if std::path::Path::new(candidate).exists() {
                    return candidate.to_string();
                }
            }
            panic!(
                "Failed to locate fryer-ctl binary. Expected CARGO_BIN_EXE_fryer-ctl or a build in target/{{release,debug}}/fryer-ctl."
            );
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .expect("Failed to bind ephemeral port for integration test");
        let addr = listener
            .local_addr()
            .expect("Failed to resolve bound address");
        let bind_addr = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let child = Command::new(&bin_path)
            .args(["--simulate", "--bind", &bind_addr, "--run-seconds", "60"])
            .args(extra_args)
            .spawn()
            .expect("Failed to start fryer-ctl");

        // Poll until the bridge listens. The probe connection is accepted and
        // dropped by the bridge, which then waits for the next client.
        let start = std::time::Instant::now();
        while start.elapsed().as_secs() < 5 {
            if TcpStream::connect(&bind_addr).is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        thread::sleep(Duration::from_millis(300));

        Self {
            child,
            addr: bind_addr,
        }
    }

    fn connect(&self) -> Client {
        let stream = TcpStream::connect(&self.addr).expect("Failed to connect to bridge");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Client { stream, reader }
    }

    /// Sends SIGINT and waits for the process to exit.
    #[cfg(unix)]
    fn interrupt(&mut self) -> std::process::ExitStatus {
        let pid = self.child.id().to_string();
        let sent = Command::new("kill")
            .args(["-INT", &pid])
            .status()
            .expect("Failed to run kill");
        assert!(sent.success());

        let start = std::time::Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "fryer-ctl did not exit after SIGINT"
            );
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for FryerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn send(&mut self, msg: Value) {
        writeln!(self.stream, "{}", msg).unwrap();
    }

    fn next(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("bad line {:?}: {}", line, e))
    }

    /// Skips status traffic until a message matches.
    fn wait_for(&mut self, what: &str, pred: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..500 {
            let msg = self.next();
            if pred(&msg) {
                return msg;
            }
        }
        panic!("never received {}", what);
    }

    fn reply_to(&mut self, command: &str) -> Value {
        self.wait_for(command, |m| m["type"] != "status" && m["command"] == command)
    }
}

#[test]
fn test_job_estop_and_reset_over_bridge() {
    let fryer = FryerProcess::start(&[]);
    let mut client = fryer.connect();

    let first = client.next();
    assert_eq!(first["type"], "status");
    assert_eq!(first["phase"], "idle");
    assert_eq!(first["link"], "connected");

    let start = json!({"type": "start", "label": "fries", "target_c": 180.0, "duration_s": 60});
    client.send(start.clone());
    assert_eq!(client.reply_to("start")["type"], "ack");
    let heating = client.wait_for("heating status", |m| m["phase"] == "heating");
    assert_eq!(heating["job"], "fries");
    assert_eq!(heating["target_c"], 180.0);

    client.send(start.clone());
    let conflict = client.reply_to("start");
    assert_eq!(conflict["type"], "error");
    assert_eq!(conflict["code"], "job_conflict");

    client.send(json!({"type": "emergency_stop"}));
    assert_eq!(client.reply_to("emergency_stop")["type"], "ack");
    let aborted = client.wait_for("aborted status", |m| {
        m["type"] == "status" && m["phase"] == "aborted" && m["emergency_latched"] == true
    });
    assert_eq!(aborted["element1"], false);
    assert_eq!(aborted["element2"], false);

    client.send(start);
    assert_eq!(client.reply_to("start")["code"], "emergency_latched");

    client.send(json!({"type": "reset"}));
    assert_eq!(client.reply_to("reset")["type"], "ack");
    client.wait_for("idle status", |m| {
        m["type"] == "status" && m["phase"] == "idle" && m["emergency_latched"] == false
    });
}

#[test]
fn test_invalid_requests_are_answered() {
    let fryer = FryerProcess::start(&[]);
    let mut client = fryer.connect();
    client.next();

    writeln!(client.stream, "this is not json").unwrap();
    let err = client.wait_for("bad_request", |m| m["type"] == "error");
    assert_eq!(err["code"], "bad_request");

    client.send(json!({"type": "start", "label": "fries", "target_c": 400.0, "duration_s": 60}));
    let err = client.reply_to("start");
    assert_eq!(err["code"], "input_range");

    client.send(json!({"type": "start", "label": "fries", "target_c": 180.0, "duration_s": 5}));
    assert_eq!(client.reply_to("start")["code"], "input_range");

    client.send(json!({"type": "status"}));
    let status = client.wait_for("status", |m| m["type"] == "status");
    assert_eq!(status["phase"], "idle");
}

#[test]
fn test_handshake_required() {
    let fryer = FryerProcess::start(&["--require-handshake"]);
    let mut client = fryer.connect();
    client.next();

    client.send(json!({"type": "emergency_stop"}));
    assert_eq!(
        client.reply_to("emergency_stop")["code"],
        "handshake_required"
    );

    client.send(json!({
        "type": "hello",
        "protocol_version": {"major": 1, "minor": 0},
        "client_id": "integration"
    }));
    assert_eq!(client.reply_to("hello")["type"], "ack");

    client.send(json!({"type": "start", "label": "fries", "target_c": 175.0, "duration_s": 30}));
    assert_eq!(client.reply_to("start")["type"], "ack");
}

#[cfg(unix)]
#[test]
fn test_sigint_shuts_down_to_safe_state() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let log_path = dir.path().join("fryer.log");
    let mut fryer = FryerProcess::start(&[
        "--audit-log",
        audit_path.to_str().unwrap(),
        "--log-file",
        log_path.to_str().unwrap(),
    ]);
    let mut client = fryer.connect();
    client.next();

    client.send(json!({"type": "start", "label": "fries", "target_c": 180.0, "duration_s": 60}));
    assert_eq!(client.reply_to("start")["type"], "ack");
    client.wait_for("heating status", |m| m["phase"] == "heating");
    drop(client);

    let status = fryer.interrupt();
    assert!(status.success(), "exit status {:?}", status);

    let audit = std::fs::read_to_string(&audit_path).unwrap();
    let events: Vec<Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["event_type"], "system_start");
    assert!(events.iter().any(|e| e["event_type"] == "job_started"));
    assert_eq!(events.last().unwrap()["event_type"], "system_shutdown");

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("Received shutdown signal"));
    assert!(log.contains("Fryer controller shut down"));
    assert!(log.contains("Run complete"));
}
