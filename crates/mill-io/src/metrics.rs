//! Prometheus metrics for millguard.
//!
//! Values are taken from servo snapshots by [`SnapshotRecorder`]; the servo
//! thread itself never touches the registry.

use mill_core::{tags, MachineSnapshot};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    REGISTRY.register(Box::new(collector.clone())).unwrap();
    collector
}

fn instance_gauge(tag: tags::Tag) -> GaugeVec {
    register(GaugeVec::new(Opts::new(tag.metric, tag.help), &["instance"]).unwrap())
}

fn instance_counter(tag: tags::Tag) -> IntCounterVec {
    register(IntCounterVec::new(Opts::new(tag.metric, tag.help), &["instance"]).unwrap())
}

// ============================================================================
// Servo Thread Metrics
// ============================================================================

pub static CYCLES_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register(IntCounter::new(tags::CYCLE_COUNT.metric, tags::CYCLE_COUNT.help).unwrap())
});

pub static CYCLES_MISSED: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "millguard_cycles_missed_total",
            "Servo cycles that started after their deadline",
        )
        .unwrap(),
    )
});

/// Servo start lateness distribution in microseconds
pub static CYCLE_JITTER_US: LazyLock<Histogram> = LazyLock::new(|| {
    register(
        Histogram::with_opts(
            HistogramOpts::new(tags::CYCLE_JITTER_US.metric, tags::CYCLE_JITTER_US.help).buckets(
                vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0],
            ),
        )
        .unwrap(),
    )
});

pub static MACHINE_ON: LazyLock<Gauge> = LazyLock::new(|| {
    register(Gauge::new(tags::MACHINE_ON.metric, tags::MACHINE_ON.help).unwrap())
});

// ============================================================================
// Component Metrics
// ============================================================================

pub static OILER_PHASE: LazyLock<GaugeVec> = LazyLock::new(|| instance_gauge(tags::OILER_PHASE));
pub static OILER_PUMP: LazyLock<GaugeVec> = LazyLock::new(|| instance_gauge(tags::OILER_PUMP));
pub static OILER_DISTANCE: LazyLock<GaugeVec> =
    LazyLock::new(|| instance_gauge(tags::OILER_DISTANCE));
pub static OILER_MOTION_TIME: LazyLock<GaugeVec> =
    LazyLock::new(|| instance_gauge(tags::OILER_MOTION_TIME));
pub static OILER_PHASE_REMAINING: LazyLock<GaugeVec> =
    LazyLock::new(|| instance_gauge(tags::OILER_PHASE_REMAINING));
pub static OILER_PUMP_CYCLES: LazyLock<IntCounterVec> =
    LazyLock::new(|| instance_counter(tags::OILER_PUMP_CYCLES));

pub static IDLE_ELAPSED: LazyLock<GaugeVec> = LazyLock::new(|| instance_gauge(tags::IDLE_ELAPSED));
pub static IDLE_SHUTDOWN: LazyLock<GaugeVec> =
    LazyLock::new(|| instance_gauge(tags::IDLE_SHUTDOWN));
pub static IDLE_TIMEOUT: LazyLock<GaugeVec> = LazyLock::new(|| instance_gauge(tags::IDLE_TIMEOUT));
pub static IDLE_SHUTDOWN_REQUESTS: LazyLock<IntCounterVec> =
    LazyLock::new(|| instance_counter(tags::IDLE_SHUTDOWN_REQUESTS));

// ============================================================================
// Bridge Metrics
// ============================================================================

/// Bridge client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    register(
        Gauge::new(
            "millguard_bridge_connected",
            "Bridge client connection status (1=connected, 0=disconnected)",
        )
        .unwrap(),
    )
});

/// Parameter writes by outcome (applied, rejected, refused by the bridge)
pub static PARAM_WRITES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("millguard_param_writes_total", "Runtime parameter writes by outcome"),
            &["result"],
        )
        .unwrap(),
    )
});

/// Copies snapshot values into the registry, turning running totals into
/// counter increments.
#[derive(Default)]
pub struct SnapshotRecorder {
    last: Option<MachineSnapshot>,
}

impl SnapshotRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, snapshot: &MachineSnapshot) {
        let last = self.last.unwrap_or_default();
        if snapshot.cycle_count == last.cycle_count && self.last.is_some() {
            return;
        }

        CYCLES_EXECUTED.inc_by(snapshot.cycle_count.saturating_sub(last.cycle_count));
        CYCLES_MISSED.inc_by(snapshot.cycles_missed.saturating_sub(last.cycles_missed));
        CYCLE_JITTER_US.observe(f64::from(snapshot.cycle_jitter_us));
        MACHINE_ON.set(bool_gauge(snapshot.machine_on));

        for (i, oiler) in snapshot.oilers().iter().enumerate() {
            let label = format!("oiler-trigger.{i}");
            let labels = [label.as_str()];
            OILER_PHASE
                .with_label_values(&labels)
                .set(f64::from(oiler.phase.code()));
            OILER_PUMP.with_label_values(&labels).set(bool_gauge(oiler.pump));
            OILER_DISTANCE.with_label_values(&labels).set(oiler.distance);
            OILER_MOTION_TIME
                .with_label_values(&labels)
                .set(oiler.motion_time_s);
            OILER_PHASE_REMAINING
                .with_label_values(&labels)
                .set(oiler.phase_remaining_s);
            let previous = last.oilers[i].pump_cycles;
            OILER_PUMP_CYCLES
                .with_label_values(&labels)
                .inc_by(u64::from(oiler.pump_cycles.saturating_sub(previous)));
        }

        for (i, timer) in snapshot.idle_timers().iter().enumerate() {
            let label = format!("idle-shutdown.{i}");
            let labels = [label.as_str()];
            IDLE_ELAPSED
                .with_label_values(&labels)
                .set(f64::from(timer.idle_elapsed_s));
            IDLE_SHUTDOWN
                .with_label_values(&labels)
                .set(bool_gauge(timer.shutdown));
            IDLE_TIMEOUT
                .with_label_values(&labels)
                .set(f64::from(timer.timeout_s));
            let previous = last.idle_timers[i].shutdown_requests;
            IDLE_SHUTDOWN_REQUESTS
                .with_label_values(&labels)
                .inc_by(u64::from(timer.shutdown_requests.saturating_sub(previous)));
        }

        self.last = Some(*snapshot);
    }
}

fn bool_gauge(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match encode_registry() {
                    Ok(body) => {
                        let mut response = Response::from_data(body);
                        if let Ok(header) = tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        ) {
                            response = response.with_header(header);
                        }
                        response
                    }
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_string("Internal Server Error")
                            .with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                "/ready" => {
                    // Ready once the servo thread has published a cycle
                    if CYCLES_EXECUTED.get() > 0 {
                        Response::from_string("Ready")
                    } else {
                        Response::from_string("Not Ready").with_status_code(503)
                    }
                }
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

fn encode_registry() -> prometheus::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = CYCLES_EXECUTED.get();
    let _ = CYCLES_MISSED.get();
    let _ = CYCLE_JITTER_US.get_sample_count();
    let _ = MACHINE_ON.get();
    LazyLock::force(&OILER_PHASE);
    LazyLock::force(&OILER_PUMP);
    LazyLock::force(&OILER_DISTANCE);
    LazyLock::force(&OILER_MOTION_TIME);
    LazyLock::force(&OILER_PHASE_REMAINING);
    LazyLock::force(&OILER_PUMP_CYCLES);
    LazyLock::force(&IDLE_ELAPSED);
    LazyLock::force(&IDLE_SHUTDOWN);
    LazyLock::force(&IDLE_TIMEOUT);
    LazyLock::force(&IDLE_SHUTDOWN_REQUESTS);
    let _ = BRIDGE_CONNECTED.get();
    LazyLock::force(&PARAM_WRITES);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_core::{IdleTelemetry, OilerTelemetry};

    #[test]
    fn recorder_turns_totals_into_increments() {
        init_metrics();
        let mut recorder = SnapshotRecorder::new();
        let mut snapshot = MachineSnapshot {
            cycle_count: 10,
            oiler_count: 1,
            idle_count: 1,
            ..MachineSnapshot::default()
        };
        snapshot.oilers[0] = OilerTelemetry {
            pump_cycles: 2,
            ..OilerTelemetry::default()
        };
        snapshot.idle_timers[0] = IdleTelemetry {
            timeout_s: 900,
            ..IdleTelemetry::default()
        };

        let pumps = OILER_PUMP_CYCLES.with_label_values(&["oiler-trigger.0"]);
        let before = pumps.get();
        recorder.record(&snapshot);
        // Same cycle again is ignored.
        recorder.record(&snapshot);
        snapshot.cycle_count = 11;
        snapshot.oilers[0].pump_cycles = 3;
        recorder.record(&snapshot);

        assert_eq!(pumps.get() - before, 3);
        assert_eq!(
            IDLE_TIMEOUT.with_label_values(&["idle-shutdown.0"]).get(),
            900.0
        );
        assert!(!encode_registry().unwrap().is_empty());
    }
}
