use fryer_core::{FryerConfig, MAX_TEMP_C, MIN_TEMP_C};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{flag} expects a value")]
    MissingValue { flag: &'static str },
    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub json_logs: bool,
    pub log_file: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub bridge_require_handshake: bool,
    pub simulate: bool,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub config_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            json_logs: false,
            log_file: None,
            metrics_addr: None,
            audit_path: None,
            bridge_require_handshake: false,
            simulate: false,
            port: None,
            baud: None,
            config_path: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &'static str) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or(ConfigError::MissingValue { flag })
}

fn parsed<T: std::str::FromStr>(raw: &str, flag: &'static str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag,
        value: raw.to_string(),
    })
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--port" => {
                    cfg.port = Some(value(args, i, "--port")?.to_string());
                    i += 1;
                }
                "--baud" => {
                    cfg.baud = Some(parsed(value(args, i, "--baud")?, "--baud")?);
                    i += 1;
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--run-seconds" => {
                    let raw = value(args, i, "--run-seconds")?;
                    cfg.run_seconds = Some(parsed(raw, "--run-seconds")?);
                    i += 1;
                }
                "--bind" => {
                    cfg.bind_addr = value(args, i, "--bind")?.to_string();
                    i += 1;
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-file" => {
                    cfg.log_file = Some(PathBuf::from(value(args, i, "--log-file")?));
                    i += 1;
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, i, "--metrics-addr")?.to_string());
                    i += 1;
                }
                "--audit-log" => {
                    cfg.audit_path = Some(PathBuf::from(value(args, i, "--audit-log")?));
                    i += 1;
                }
                "--require-handshake" => {
                    cfg.bridge_require_handshake = true;
                }
                "--config" => {
                    cfg.config_path = Some(PathBuf::from(value(args, i, "--config")?));
                    i += 1;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        flag: "argument",
                        value: other.to_string(),
                    })
                }
            }
            i += 1;
        }
        Ok(cfg)
    }

    /// Defaults, then the config file, then command-line overrides.
    pub fn fryer_config(&self) -> Result<FryerConfig, ConfigError> {
        let mut fryer = FryerConfig::default();
        if let Some(path) = &self.config_path {
            FileConfig::load(path)?.apply(&mut fryer);
        }
        if let Some(port) = &self.port {
            fryer.port.path = port.clone();
        }
        if let Some(baud) = self.baud {
            fryer.port.baud = baud;
        }
        validate(&fryer)?;
        Ok(fryer)
    }

    pub fn print_help() {
        println!(
            r#"fryer-ctl - Induction fryer controller

USAGE:
    fryer-ctl [OPTIONS]

OPTIONS:
    --port <PATH>           Serial device of the fryer board [default: /dev/serial0]
    --baud <RATE>           Serial baud rate [default: 9600]
    --simulate              Drive a simulated fryer instead of the serial port
    --config <PATH>         TOML file with [serial], [limits] and [timing] overrides
    --bind <ADDR>           Bridge TCP bind address [default: 127.0.0.1:7000]
    --no-bridge             Disable the operator bridge
    --require-handshake     Require a hello message before accepting commands
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-file <PATH>       Also write logs to a file
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,fryer_core=trace)

EXAMPLES:
    # Run against the real board with metrics
    fryer-ctl --port /dev/ttyUSB0 --metrics-addr 0.0.0.0:9090

    # Production run with all observability
    fryer-ctl --json-logs --log-file /var/log/fryer/fryer.log --audit-log /var/log/fryer/audit.jsonl

    # Short simulated run
    fryer-ctl --simulate --run-seconds 10 --no-bridge
"#
        );
    }
}

fn validate(cfg: &FryerConfig) -> Result<(), ConfigError> {
    let limits = &cfg.limits;
    // Targets outside the sensor range would be clamped and never reached.
    if limits.min_target_c < MIN_TEMP_C || limits.max_target_c > MAX_TEMP_C {
        return Err(ConfigError::Inconsistent(format!(
            "target range {}..={} must lie within {}..={}",
            limits.min_target_c, limits.max_target_c, MIN_TEMP_C, MAX_TEMP_C
        )));
    }
    if limits.min_target_c > limits.max_target_c {
        return Err(ConfigError::Inconsistent(format!(
            "min_target_c {} exceeds max_target_c {}",
            limits.min_target_c, limits.max_target_c
        )));
    }
    if limits.min_duration_s > limits.max_duration_s {
        return Err(ConfigError::Inconsistent(format!(
            "min_duration_s {} exceeds max_duration_s {}",
            limits.min_duration_s, limits.max_duration_s
        )));
    }
    if cfg.link.retries == 0 {
        return Err(ConfigError::Inconsistent("retries must be at least 1".into()));
    }
    if cfg.tick_interval.is_zero() || cfg.actuator.resend_interval.is_zero() {
        return Err(ConfigError::Inconsistent(
            "tick and resend intervals must be non-zero".into(),
        ));
    }
    if cfg.hysteresis_c < 0.0 {
        return Err(ConfigError::Inconsistent("hysteresis_c must be >= 0".into()));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerialSection {
    path: Option<String>,
    baud: Option<u32>,
    read_timeout_ms: Option<u64>,
    retries: Option<u32>,
    command_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitsSection {
    min_target_c: Option<f64>,
    max_target_c: Option<f64>,
    min_duration_s: Option<u32>,
    max_duration_s: Option<u32>,
    default_target_c: Option<f64>,
    hysteresis_c: Option<f64>,
    lower_band_c: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimingSection {
    tick_interval_ms: Option<u64>,
    reconnect_interval_ms: Option<u64>,
    actuation_window_ms: Option<u64>,
    resend_interval_ms: Option<u64>,
    abort_poll_ms: Option<u64>,
    heating_poll_ms: Option<u64>,
    countdown_poll_ms: Option<u64>,
    sim_step_c: Option<f64>,
    ambient_c: Option<f64>,
}

/// On-disk overrides. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    serial: SerialSection,
    #[serde(default)]
    limits: LimitsSection,
    #[serde(default)]
    timing: TimingSection,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_ms(slot: &mut Duration, ms: Option<u64>) {
    set(slot, ms.map(Duration::from_millis));
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn apply(self, cfg: &mut FryerConfig) {
        let FileConfig {
            serial,
            limits,
            timing,
        } = self;

        set(&mut cfg.port.path, serial.path);
        set(&mut cfg.port.baud, serial.baud);
        set_ms(&mut cfg.port.read_timeout, serial.read_timeout_ms);
        set(&mut cfg.link.retries, serial.retries);
        set_ms(&mut cfg.link.command_delay, serial.command_delay_ms);

        set(&mut cfg.limits.min_target_c, limits.min_target_c);
        set(&mut cfg.limits.max_target_c, limits.max_target_c);
        set(&mut cfg.limits.min_duration_s, limits.min_duration_s);
        set(&mut cfg.limits.max_duration_s, limits.max_duration_s);
        set(&mut cfg.default_target_c, limits.default_target_c);
        set(&mut cfg.hysteresis_c, limits.hysteresis_c);
        set(&mut cfg.cycle.lower_band_c, limits.lower_band_c);

        set_ms(&mut cfg.tick_interval, timing.tick_interval_ms);
        set_ms(&mut cfg.reconnect_interval, timing.reconnect_interval_ms);
        set_ms(&mut cfg.actuator.window, timing.actuation_window_ms);
        set_ms(&mut cfg.actuator.resend_interval, timing.resend_interval_ms);
        if let Some(ms) = timing.abort_poll_ms {
            cfg.actuator.abort_poll = Duration::from_millis(ms);
            cfg.cycle.abort_poll = Duration::from_millis(ms);
        }
        set_ms(&mut cfg.cycle.heating_poll, timing.heating_poll_ms);
        set_ms(&mut cfg.cycle.countdown_poll, timing.countdown_poll_ms);
        set(&mut cfg.sim_step_c, timing.sim_step_c);
        set(&mut cfg.ambient_c, timing.ambient_c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("fryer-ctl")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_match_the_board() {
        let cfg = RuntimeConfig::from_args(&args(&[])).unwrap();
        assert!(cfg.bridge_enabled);
        assert!(!cfg.simulate);
        let fryer = cfg.fryer_config().unwrap();
        assert_eq!(fryer.port.path, "/dev/serial0");
        assert_eq!(fryer.port.baud, 9600);
        assert_eq!(fryer.link.retries, 4);
    }

    #[test]
    fn parses_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--simulate",
            "--port",
            "/dev/ttyUSB1",
            "--baud",
            "19200",
            "--run-seconds",
            "3",
            "--no-bridge",
            "--require-handshake",
            "--log-file",
            "/tmp/fryer.log",
        ]))
        .unwrap();
        assert!(cfg.simulate);
        assert!(!cfg.bridge_enabled);
        assert!(cfg.bridge_require_handshake);
        assert_eq!(cfg.run_seconds, Some(3));
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/fryer.log")));
        let fryer = cfg.fryer_config().unwrap();
        assert_eq!(fryer.port.path, "/dev/ttyUSB1");
        assert_eq!(fryer.port.baud, 19200);
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--baud", "fast"])),
            Err(ConfigError::InvalidValue { flag: "--baud", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--port"])),
            Err(ConfigError::MissingValue { flag: "--port" })
        ));
        assert!(RuntimeConfig::from_args(&args(&["--turbo"])).is_err());
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--turbo"])).unwrap();
        assert!(cfg.show_help);
    }

    #[test]
    fn file_overrides_defaults_and_cli_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[serial]
path = "/dev/ttyAMA0"
baud = 115200
retries = 2

[limits]
max_target_c = 200.0
hysteresis_c = 1.5

[timing]
actuation_window_ms = 20000
abort_poll_ms = 50
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cfg = RuntimeConfig::from_args(&args(&["--config", &path, "--baud", "9600"])).unwrap();
        let fryer = cfg.fryer_config().unwrap();

        assert_eq!(fryer.port.path, "/dev/ttyAMA0");
        assert_eq!(fryer.port.baud, 9600);
        assert_eq!(fryer.link.retries, 2);
        assert_eq!(fryer.limits.max_target_c, 200.0);
        assert_eq!(fryer.limits.min_target_c, 100.0);
        assert_eq!(fryer.hysteresis_c, 1.5);
        assert_eq!(fryer.actuator.window, Duration::from_secs(20));
        assert_eq!(fryer.actuator.abort_poll, Duration::from_millis(50));
        assert_eq!(fryer.cycle.abort_poll, Duration::from_millis(50));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::parse("[serial]\nspeed = 3\n").is_err());
    }

    #[test]
    fn inverted_limits_are_rejected() {
        let mut fryer = FryerConfig::default();
        FileConfig::parse("[limits]\nmin_target_c = 240.0\nmax_target_c = 120.0\n")
            .unwrap()
            .apply(&mut fryer);
        assert!(matches!(validate(&fryer), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn targets_beyond_sensor_range_are_rejected() {
        for toml in [
            "[limits]\nmax_target_c = 300.0\n",
            "[limits]\nmin_target_c = 5.0\n",
        ] {
            let mut fryer = FryerConfig::default();
            FileConfig::parse(toml).unwrap().apply(&mut fryer);
            assert!(
                matches!(validate(&fryer), Err(ConfigError::Inconsistent(_))),
                "{toml}"
            );
        }

        let mut fryer = FryerConfig::default();
        FileConfig::parse("[limits]\nmin_target_c = 20.0\nmax_target_c = 250.0\n")
            .unwrap()
            .apply(&mut fryer);
        assert!(validate(&fryer).is_ok());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let cfg = RuntimeConfig {
            config_path: Some(PathBuf::from("/nonexistent/fryer.toml")),
            ..RuntimeConfig::default()
        };
        assert!(matches!(cfg.fryer_config(), Err(ConfigError::Read { .. })));
    }
}
