use clap::Parser;
use mill_core::{IdleParams, OilerParams, ServoConfig, SimProfile};
use std::path::PathBuf;
use std::time::Duration;

use super::app::AppError;

/// Lubrication and idle-shutdown guard for CNC mills.
///
/// Runs the oiler trigger and idle shutdown timer against a simulated
/// three-axis mill, with a line-delimited JSON diagnostic bridge.
///
/// Log filter: RUST_LOG (e.g. RUST_LOG=debug,mill_core=trace).
#[derive(Debug, Clone, Parser)]
#[command(name = "millguard", version, allow_negative_numbers = true)]
pub struct RuntimeConfig {
    /// Run for a fixed duration then exit
    #[arg(long, value_name = "SECS")]
    pub run_seconds: Option<u64>,

    /// Bridge TCP bind address
    #[arg(long = "bind", value_name = "ADDR", default_value = "127.0.0.1:7100")]
    pub bind_addr: String,

    /// Disable the diagnostic bridge
    #[arg(long)]
    pub no_bridge: bool,

    /// Require a hello handshake before accepting set_param
    #[arg(long)]
    pub require_handshake: bool,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Also write JSON logs to a daily-rolling file in this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Enable the Prometheus metrics server on this address (e.g. 0.0.0.0:9090)
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<String>,

    /// Append audit events to this JSONL file
    #[arg(long = "audit-log", value_name = "PATH")]
    pub audit_path: Option<PathBuf>,

    /// Servo thread period in microseconds
    #[arg(long, value_name = "US", default_value_t = 1000)]
    pub cycle_us: u64,

    /// Overrun that trips the watchdog, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 100)]
    pub watchdog_ms: u64,

    /// Number of oiler-trigger instances
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub oilers: usize,

    /// Number of idle-shutdown instances
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub idle_timers: usize,

    /// Travel distance that triggers lubrication (machine units)
    #[arg(long, value_name = "UNITS", default_value_t = 5000.0)]
    pub oiler_distance: f32,

    /// Motion time that triggers lubrication (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 1800.0)]
    pub oiler_time: f32,

    /// Pump on-time per lubrication pulse (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 2.0)]
    pub oiler_pump: f32,

    /// Lockout after each pulse (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 60.0)]
    pub oiler_lockout: f32,

    /// Inactivity before machine-off is requested (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 900)]
    pub idle_timeout: u32,

    /// JSON netlist; the stock netlist is used when omitted
    #[arg(long, value_name = "PATH")]
    pub netlist: Option<PathBuf>,

    /// Simulated homing time after power-on (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 2.0)]
    pub sim_homing_seconds: f32,

    /// Simulated programme length (seconds)
    #[arg(long, value_name = "SECS", default_value_t = 30.0)]
    pub sim_program_seconds: f32,

    /// Simulated feed rate (machine units per second)
    #[arg(long, value_name = "RATE", default_value_t = 50.0)]
    pub sim_feed_rate: f32,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::parse()
    }

    pub fn bridge_enabled(&self) -> bool {
        !self.no_bridge
    }

    pub fn servo_config(&self) -> Result<ServoConfig, AppError> {
        if self.cycle_us == 0 {
            return Err(AppError::InvalidArgument {
                name: "cycle-us",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(ServoConfig {
            cycle_time: Duration::from_micros(self.cycle_us),
            watchdog_timeout: Duration::from_millis(self.watchdog_ms),
        })
    }

    /// Raw oiler parameters; range checks happen when instances are loaded.
    pub fn oiler_params(&self) -> OilerParams {
        OilerParams {
            distance_threshold: self.oiler_distance,
            time_threshold: self.oiler_time,
            pump_duration: self.oiler_pump,
            lockout_duration: self.oiler_lockout,
        }
    }

    pub fn idle_params(&self) -> IdleParams {
        IdleParams {
            timeout_s: self.idle_timeout,
        }
    }

    pub fn sim_profile(&self) -> Result<SimProfile, AppError> {
        if !self.sim_feed_rate.is_finite() || self.sim_feed_rate < 0.0 {
            return Err(AppError::InvalidArgument {
                name: "sim-feed-rate",
                reason: format!("{} is not a finite non-negative rate", self.sim_feed_rate),
            });
        }
        Ok(SimProfile {
            homing_time: seconds("sim-homing-seconds", self.sim_homing_seconds)?,
            program_time: seconds("sim-program-seconds", self.sim_program_seconds)?,
            feed_rate: self.sim_feed_rate,
            ..SimProfile::default()
        })
    }
}

fn seconds(name: &'static str, value: f32) -> Result<Duration, AppError> {
    Duration::try_from_secs_f32(value).map_err(|e| AppError::InvalidArgument {
        name,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RuntimeConfig {
        let argv = std::iter::once("millguard").chain(args.iter().copied());
        RuntimeConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_component_defaults() {
        let cfg = parse(&[]);
        assert_eq!(cfg.bind_addr, "127.0.0.1:7100");
        assert!(cfg.bridge_enabled());
        assert_eq!(cfg.oiler_params(), OilerParams::default());
        assert_eq!(cfg.idle_params(), IdleParams::default());
        assert_eq!(cfg.servo_config().unwrap().cycle_time, Duration::from_millis(1));
    }

    #[test]
    fn parses_component_parameters() {
        let cfg = parse(&[
            "--oilers",
            "2",
            "--oiler-distance",
            "1000",
            "--oiler-pump",
            "-1",
            "--idle-timeout",
            "10",
            "--no-bridge",
            "--run-seconds",
            "3",
        ]);
        assert_eq!(cfg.oilers, 2);
        assert_eq!(cfg.oiler_params().distance_threshold, 1000.0);
        assert_eq!(cfg.oiler_params().pump_duration, -1.0);
        assert_eq!(cfg.idle_params().timeout_s, 10);
        assert!(!cfg.bridge_enabled());
        assert_eq!(cfg.run_seconds, Some(3));
    }

    #[test]
    fn rejects_bad_simulation_and_cycle_settings() {
        assert!(parse(&["--sim-homing-seconds", "-2"]).sim_profile().is_err());
        assert!(parse(&["--sim-feed-rate", "NaN"]).sim_profile().is_err());
        assert!(parse(&["--cycle-us", "0"]).servo_config().is_err());
        assert!(RuntimeConfig::try_parse_from(["millguard", "--idle-timeout", "-5"]).is_err());
    }
}
