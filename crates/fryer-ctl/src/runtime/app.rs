use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::{ConfigError, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use fryer_core::{Clock, FryerController, PortOpener, SimulatedFryer, TimeBase};
use fryer_io::bridge::{run_bridge, BridgeConfig};
use fryer_io::serial::SerialPortOpener;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// Process exit code.
pub fn run_from_args() -> i32 {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fryer-ctl: {}", e);
            eprintln!("Try 'fryer-ctl --help' for more information.");
            return 2;
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return 0;
    }
    match run(config) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "fryer-ctl failed");
            1
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs, config.log_file.as_deref());

    let fryer_config = config.fryer_config()?;

    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let clock: Arc<dyn Clock> = Arc::new(timebase);

    let opener: Box<dyn PortOpener> = if config.simulate {
        info!(ambient_c = fryer_config.ambient_c, "Using simulated fryer");
        Box::new(SimulatedFryer::new(Arc::clone(&clock)).with_oil_temperature(fryer_config.ambient_c))
    } else {
        info!(
            port = %fryer_config.port.path,
            baud = fryer_config.port.baud,
            "Using serial fryer"
        );
        Box::new(SerialPortOpener::new(fryer_config.port.clone()))
    };

    info!(
        tick_interval_ms = fryer_config.tick_interval.as_millis() as u64,
        hysteresis_c = fryer_config.hysteresis_c,
        min_target_c = fryer_config.limits.min_target_c,
        max_target_c = fryer_config.limits.max_target_c,
        "Starting fryer controller"
    );
    let controller = Arc::new(FryerController::new(opener, fryer_config, clock));

    let audit_logger = init_audit_logger(config.audit_path.as_ref())?;
    if let Some(ref logger) = audit_logger {
        let _ = logger.log_event(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "simulated": config.simulate,
                "link": controller.link().describe(),
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": metrics_enabled,
            }),
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    let audit_handle = audit_logger.as_ref().map(|logger| {
        telemetry::start_audit_recorder(
            Arc::clone(&controller),
            Arc::clone(logger),
            timebase,
            Arc::clone(&stop),
        )
    });
    let updater_handle = metrics_enabled
        .then(|| telemetry::start_metrics_updater(Arc::clone(&controller), Arc::clone(&stop)));

    let control_handle = {
        let controller = Arc::clone(&controller);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("fryer-control".into())
            .spawn(move || controller.run(&stop))
            .map_err(|source| AppError::Spawn {
                name: "control",
                source,
            })?
    };

    let bridge_handle = if config.bridge_enabled {
        let controller = Arc::clone(&controller);
        let stop_bridge = Arc::clone(&stop);
        let bridge_config = BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            require_handshake: config.bridge_require_handshake,
            ..Default::default()
        };
        info!(addr = %bridge_config.bind_addr, "Starting bridge");
        let handle = thread::Builder::new()
            .name("fryer-bridge".into())
            .spawn(move || {
                if let Err(e) = run_bridge(controller, timebase, bridge_config, stop_bridge) {
                    error!(error = %e, "Bridge failed");
                }
            })
            .map_err(|source| AppError::Spawn {
                name: "bridge",
                source,
            })?;
        Some(handle)
    } else {
        info!("Bridge disabled");
        None
    };

    info!("Fryer controller running");

    let deadline = config.run_seconds.map(|seconds| {
        info!(seconds, "Running for limited duration");
        Instant::now() + Duration::from_secs(seconds)
    });
    while !stop.load(Ordering::SeqCst) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Run duration elapsed");
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    stop.store(true, Ordering::SeqCst);

    for (name, handle) in [("control", Some(control_handle)), ("bridge", bridge_handle)] {
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(thread = name, "Thread panicked");
            }
        }
    }

    controller.shutdown();
    let stats = controller.stats();
    let snapshot = controller.snapshot();
    info!(
        ticks = stats.ticks,
        overruns = stats.overruns,
        max_jitter_us = stats.max_jitter_us,
        cycles_completed = snapshot.counters.cycles_completed,
        cycles_aborted = snapshot.counters.cycles_aborted,
        "Run complete"
    );

    for handle in [audit_handle, updater_handle].into_iter().flatten() {
        let _ = handle.join();
    }

    if let Some(ref logger) = audit_logger {
        let _ = logger.log_event(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemShutdown,
            serde_json::json!({
                "ticks": stats.ticks,
                "overruns": stats.overruns,
                "cycles_completed": snapshot.counters.cycles_completed,
                "cycles_aborted": snapshot.counters.cycles_aborted,
                "emergency_stops": snapshot.counters.emergency_stops,
            }),
        );
    }
    Ok(())
}

fn init_audit_logger(audit_path: Option<&PathBuf>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    audit_path
        .map(|path| match AuditLogger::new(path) {
            Ok(logger) => {
                info!(path = %path.display(), "Audit logging enabled");
                Ok(Arc::new(logger))
            }
            Err(source) => Err(AppError::Audit {
                path: path.clone(),
                source,
            }),
        })
        .transpose()
}
