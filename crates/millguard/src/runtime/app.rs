use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::{init_tracing, LoggingError};
use crate::runtime::telemetry;
use mill_core::{
    ComponentSet, ExecutionStats, LoadError, Netlist, ServoFault, ServoThread, SimulatedMill,
    StateExchange, TimeBase, WiringError,
};
use mill_io::{run_bridge, BridgeConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("netlist: {0}")]
    Wiring(#[from] WiringError),
    #[error("cannot open audit log {}: {source}", path.display())]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("--{name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("servo thread stopped: {0}")]
    Servo(#[from] ServoFault),
    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

pub fn run_from_args() -> ExitCode {
    let config = RuntimeConfig::from_env();

    // Held until exit so the file writer flushes.
    let _log_guard = match init_tracing(config.json_logs, config.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("millguard: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "millguard stopped with an error");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let servo_config = config.servo_config()?;
    let profile = config.sim_profile()?;

    let mut components = ComponentSet::new();
    components.load_oilers(config.oilers, config.oiler_params())?;
    components.load_idle_timers(config.idle_timers, config.idle_params())?;

    let netlist = match &config.netlist {
        Some(path) => {
            info!(path = %path.display(), "Loading netlist");
            Netlist::load(path)?
        }
        None => Netlist::stock(&components),
    };

    let exchange = Arc::new(StateExchange::new());
    let timebase = TimeBase::new();
    let audit = config
        .audit_path
        .as_deref()
        .map(init_audit_logger)
        .transpose()?;

    audit_event(
        audit.as_deref(),
        &timebase,
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "oilers": config.oilers,
            "idle_timers": config.idle_timers,
            "bridge_enabled": config.bridge_enabled(),
            "metrics_enabled": metrics_enabled,
        }),
    );

    let directory = components.param_directory();
    let mut servo = ServoThread::new(
        SimulatedMill::new(profile),
        servo_config.clone(),
        components,
        &netlist,
        Arc::clone(&exchange),
        timebase,
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let monitor_stop = Arc::new(AtomicBool::new(false));

    info!(
        cycle_us = servo_config.cycle_time.as_micros() as u64,
        watchdog_ms = servo_config.watchdog_timeout.as_millis() as u64,
        oilers = config.oilers,
        idle_timers = config.idle_timers,
        "Starting servo thread"
    );

    let stop_servo = Arc::clone(&stop);
    let servo_handle = thread::Builder::new()
        .name("servo".into())
        .spawn(move || {
            let result = servo.run(&stop_servo);
            (result, servo.stats().clone())
        })
        .map_err(|source| AppError::Spawn {
            name: "servo",
            source,
        })?;

    let monitor_handle = telemetry::start_monitor(
        Arc::clone(&exchange),
        timebase,
        audit.clone(),
        Arc::clone(&monitor_stop),
    );

    let bridge_handle = if config.bridge_enabled() {
        let bridge_config = BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            require_handshake: config.require_handshake,
            ..BridgeConfig::default()
        };
        info!(addr = %bridge_config.bind_addr, "Starting bridge");
        let exchange_bridge = Arc::clone(&exchange);
        let stop_bridge = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("bridge".into())
            .spawn(move || {
                if let Err(e) =
                    run_bridge(exchange_bridge, timebase, bridge_config, directory, stop_bridge)
                {
                    error!(error = %e, "Bridge stopped");
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

    let deadline = config
        .run_seconds
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
    }
    while !servo_handle.is_finished() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    stop.store(true, Ordering::Relaxed);
    let joined = servo_handle.join();
    monitor_stop.store(true, Ordering::Relaxed);
    if monitor_handle.join().is_err() {
        warn!("Telemetry monitor panicked");
    }
    if let Some(handle) = bridge_handle {
        if handle.join().is_err() {
            warn!("Bridge thread panicked");
        }
    }

    let (result, stats) = joined.map_err(|_| AppError::Panicked("servo"))?;
    report_run(&stats);

    if let Err(fault) = &result {
        error!(error = %fault, "Servo thread faulted, outputs forced off");
        audit_event(
            audit.as_deref(),
            &timebase,
            AuditEventType::WatchdogTimeout,
            serde_json::json!({ "fault": fault.to_string() }),
        );
    }
    audit_event(
        audit.as_deref(),
        &timebase,
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "cycles_executed": stats.cycles_executed,
            "cycles_missed": stats.cycles_missed,
            "params_applied": stats.params_applied,
            "params_rejected": stats.params_rejected,
        }),
    );

    result.map_err(AppError::from)
}

fn report_run(stats: &ExecutionStats) {
    info!(
        cycles_executed = stats.cycles_executed,
        cycles_missed = stats.cycles_missed,
        max_jitter_us = stats.max_jitter_us,
        params_applied = stats.params_applied,
        params_rejected = stats.params_rejected,
        "Run complete"
    );
}

fn init_audit_logger(path: &Path) -> Result<Arc<AuditLogger>, AppError> {
    let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Arc::new(logger))
}

fn audit_event(
    audit: Option<&AuditLogger>,
    timebase: &TimeBase,
    event: AuditEventType,
    details: serde_json::Value,
) {
    if let Some(logger) = audit {
        if let Err(e) = logger.log_event(timebase.now_us(), timebase.unix_us(), event, details) {
            warn!(error = %e, ?event, "Failed to write audit event");
        }
    }
}
