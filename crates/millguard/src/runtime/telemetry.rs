use crate::infra::audit::{
    AuditEventType, AuditLogger, ConfigChangeDetails, MachineOffDetails, PumpCycleDetails,
};
use mill_core::{MachineSnapshot, ParamAckStatus, StateExchange, TimeBase, TriggerCause};
use mill_io::metrics::{init_metrics, serve_metrics};
use mill_io::SnapshotRecorder;
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Something worth a log line or an audit record, derived from two
/// consecutive snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    PumpCycle {
        instance: usize,
        cause: Option<TriggerCause>,
        pump_cycles: u32,
    },
    MachineOffRequested {
        instance: usize,
        idle_elapsed_s: u32,
        timeout_s: u32,
    },
    MachinePower(bool),
    ParamAck {
        sequence: u64,
        status: ParamAckStatus,
    },
    TimeoutChanged {
        instance: usize,
        old: u32,
        new: u32,
    },
}

pub fn diff(prev: &MachineSnapshot, cur: &MachineSnapshot) -> Vec<Transition> {
    let mut out = Vec::new();

    if prev.machine_on != cur.machine_on {
        out.push(Transition::MachinePower(cur.machine_on));
    }

    for (i, oiler) in cur.oilers().iter().enumerate() {
        if oiler.pump_cycles != prev.oilers[i].pump_cycles {
            out.push(Transition::PumpCycle {
                instance: i,
                cause: oiler.last_cause,
                pump_cycles: oiler.pump_cycles,
            });
        }
    }

    for (i, timer) in cur.idle_timers().iter().enumerate() {
        let before = &prev.idle_timers[i];
        if timer.shutdown_requests != before.shutdown_requests {
            out.push(Transition::MachineOffRequested {
                instance: i,
                idle_elapsed_s: timer.idle_elapsed_s,
                timeout_s: timer.timeout_s,
            });
        }
        if i < prev.idle_count && timer.timeout_s != before.timeout_s {
            out.push(Transition::TimeoutChanged {
                instance: i,
                old: before.timeout_s,
                new: timer.timeout_s,
            });
        }
    }

    if cur.param_ack.sequence != prev.param_ack.sequence {
        out.push(Transition::ParamAck {
            sequence: cur.param_ack.sequence,
            status: cur.param_ack.status,
        });
    }

    out
}

/// Polls the exchange, feeds Prometheus and reports transitions until `stop`
/// is set. One last poll runs after the stop so the final snapshot is seen.
pub fn start_monitor(
    exchange: Arc<StateExchange>,
    timebase: TimeBase,
    audit: Option<Arc<AuditLogger>>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut recorder = SnapshotRecorder::new();
        let mut last = MachineSnapshot::default();
        loop {
            let stopping = stop.load(std::sync::atomic::Ordering::Relaxed);
            let snapshot = exchange.read_state();
            recorder.record(&snapshot);
            for transition in diff(&last, &snapshot) {
                report(&transition, &timebase, audit.as_deref());
            }
            last = snapshot;
            if stopping {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    })
}

fn report(transition: &Transition, timebase: &TimeBase, audit: Option<&AuditLogger>) {
    let (event, details) = match transition {
        Transition::PumpCycle {
            instance,
            cause,
            pump_cycles,
        } => {
            let cause = cause.map_or("unknown", |c| c.as_str());
            info!(instance, cause, pump_cycles, "Lubrication pulse started");
            let details = PumpCycleDetails {
                instance: format!("oiler-trigger.{instance}"),
                cause,
                pump_cycles: *pump_cycles,
            };
            (AuditEventType::PumpCycle, serde_json::to_value(details))
        }
        Transition::MachineOffRequested {
            instance,
            idle_elapsed_s,
            timeout_s,
        } => {
            warn!(instance, idle_elapsed_s, timeout_s, "Idle timeout, requesting machine off");
            let details = MachineOffDetails {
                instance: format!("idle-shutdown.{instance}"),
                idle_elapsed_s: *idle_elapsed_s,
                timeout_s: *timeout_s,
            };
            (AuditEventType::MachineOffRequested, serde_json::to_value(details))
        }
        Transition::MachinePower(on) => {
            info!(machine_on = on, "Machine power changed");
            let event = if *on {
                AuditEventType::MachinePowerOn
            } else {
                AuditEventType::MachinePowerOff
            };
            (event, Ok(serde_json::json!({})))
        }
        Transition::ParamAck { sequence, status } => {
            let status = match status {
                ParamAckStatus::Applied => "applied",
                ParamAckStatus::Rejected => "rejected",
                ParamAckStatus::None => "none",
            };
            debug!(sequence, status, "Parameter write acknowledged");
            (
                AuditEventType::ParamWrite,
                Ok(serde_json::json!({ "request_sequence": sequence, "status": status })),
            )
        }
        Transition::TimeoutChanged { instance, old, new } => {
            info!(instance, old, new, "Idle timeout changed");
            let details = ConfigChangeDetails {
                param: format!("idle-shutdown.{instance}.timeout"),
                old_value: *old,
                new_value: *new,
            };
            (AuditEventType::ConfigChange, serde_json::to_value(details))
        }
    };

    let Some(logger) = audit else {
        return;
    };
    let result = details
        .map_err(std::io::Error::from)
        .and_then(|details| {
            logger.log_event(timebase.now_us(), timebase.unix_us(), event, details)
        });
    if let Err(e) = result {
        warn!(error = %e, "Failed to write audit event");
    }
}
