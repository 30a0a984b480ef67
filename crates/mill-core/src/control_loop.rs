use crate::hal::MachineIO;
use crate::instance::{ComponentSet, Instance};
use crate::sync::{
    IdleTelemetry, MachineSnapshot, OilerTelemetry, ParamAck, ParamAckStatus, StateExchange,
};
use crate::timebase::{CycleClock, Deadline, TimeBase};
use crate::wiring::{MachinePorts, Netlist, SignalBus, Wiring, WiringError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct ServoConfig {
    pub cycle_time: Duration,
    pub watchdog_timeout: Duration,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            cycle_time: Duration::from_millis(1),
            watchdog_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct ExecutionStats {
    pub cycles_executed: u64,
    pub cycles_missed: u64,
    pub max_jitter_us: u64,
    pub params_applied: u64,
    pub params_rejected: u64,
    pub watchdog_tripped: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServoFault {
    #[error("watchdog tripped: cycle overran its deadline by {overrun_us}us")]
    Watchdog { overrun_us: u64 },
    #[error("machine I/O reported an unhealthy state")]
    IoUnhealthy,
}

/// Owns the machine and every component instance; runs them at a fixed period.
pub struct ServoThread<IO: MachineIO> {
    io: IO,
    config: ServoConfig,
    components: ComponentSet,
    wiring: Wiring,
    ports: MachinePorts,
    exchange: Arc<StateExchange>,
    stats: ExecutionStats,
    timebase: TimeBase,
    last_param_seq: u64,
    last_manual_lube: u64,
    snapshot: MachineSnapshot,
}

impl<IO: MachineIO> ServoThread<IO> {
    pub fn new(
        io: IO,
        config: ServoConfig,
        components: ComponentSet,
        netlist: &Netlist,
        exchange: Arc<StateExchange>,
        timebase: TimeBase,
    ) -> Result<Self, WiringError> {
        let mut bus = SignalBus::new();
        let ports = MachinePorts::declare(&mut bus)?;
        let wiring = Wiring::resolve(netlist, &components, bus)?;
        let last_manual_lube = exchange.manual_lube_requests();
        Ok(Self {
            io,
            config,
            components,
            wiring,
            ports,
            exchange,
            stats: ExecutionStats::default(),
            timebase,
            last_param_seq: 0,
            last_manual_lube,
            snapshot: MachineSnapshot::default(),
        })
    }

    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ServoFault> {
        let mut clock = CycleClock::new(self.config.cycle_time);
        let result = loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            let jitter = match clock.wait() {
                Deadline::OnTime => Duration::ZERO,
                Deadline::Late(overrun) => {
                    self.stats.cycles_missed += 1;
                    if overrun > self.config.watchdog_timeout {
                        self.stats.watchdog_tripped = true;
                        break Err(ServoFault::Watchdog {
                            overrun_us: saturating_us(overrun),
                        });
                    }
                    overrun
                }
            };
            if let Err(fault) = self.step(jitter) {
                break Err(fault);
            }
        };
        self.safe_stop();
        result
    }

    /// Execute one cycle. `jitter` is how late the cycle started.
    pub fn step(&mut self, jitter: Duration) -> Result<(), ServoFault> {
        let period = self.config.cycle_time;
        let timestamp_us = self.timebase.now_us();

        let ack = self.apply_param_request();

        self.io.step(period);
        if !self.io.is_healthy() {
            return Err(ServoFault::IoUnhealthy);
        }
        let mut telemetry = self.io.read_telemetry();
        // A remote request is pressed for exactly one cycle.
        let lube_requests = self.exchange.manual_lube_requests();
        telemetry.manual_lube |= lube_requests != self.last_manual_lube;
        self.last_manual_lube = lube_requests;

        self.ports.export(&telemetry, self.wiring.bus_mut());
        self.wiring.drive_inputs(&mut self.components);
        self.components.update_all(period);
        self.wiring.collect_outputs(&self.components);

        let pump = self.ports.pump(self.wiring.bus());
        let machine_off = self.ports.machine_off(self.wiring.bus());
        self.io.write_pump(pump);
        self.io.write_machine_off(machine_off);

        let jitter_us = saturating_us(jitter);
        self.stats.max_jitter_us = self.stats.max_jitter_us.max(jitter_us);
        self.stats.cycles_executed += 1;

        let snapshot = self.capture(MachineSnapshot {
            timestamp_us,
            cycle_count: self.stats.cycles_executed,
            cycles_missed: self.stats.cycles_missed,
            cycle_jitter_us: u32::try_from(jitter_us).unwrap_or(u32::MAX),
            machine_on: telemetry.machine_on,
            pump_relay: pump,
            machine_off_request: machine_off,
            param_ack: ack.unwrap_or(self.snapshot.param_ack),
            ..MachineSnapshot::default()
        });
        self.exchange.publish_state(snapshot);
        Ok(())
    }

    /// Fill in per-instance telemetry and keep the result as the latest
    /// snapshot.
    fn capture(&mut self, mut snapshot: MachineSnapshot) -> MachineSnapshot {
        for (id, inst) in self.components.iter() {
            let idx = usize::from(id.index);
            match inst {
                Instance::Oiler(oiler) => {
                    snapshot.oilers[idx] =
                        OilerTelemetry::capture(oiler, &self.snapshot.oilers[idx]);
                    snapshot.oiler_count = snapshot.oiler_count.max(idx + 1);
                }
                Instance::Idle(timer) => {
                    snapshot.idle_timers[idx] = IdleTelemetry::capture(timer);
                    snapshot.idle_count = snapshot.idle_count.max(idx + 1);
                }
            }
        }
        self.snapshot = snapshot;
        snapshot
    }

    fn apply_param_request(&mut self) -> Option<ParamAck> {
        let req = self.exchange.take_param_request(self.last_param_seq)?;
        self.last_param_seq = req.sequence;
        let status = match self.components.write_param(req.target, req.value) {
            Ok(()) => {
                self.stats.params_applied += 1;
                ParamAckStatus::Applied
            }
            Err(_) => {
                self.stats.params_rejected += 1;
                ParamAckStatus::Rejected
            }
        };
        Some(ParamAck {
            sequence: req.sequence,
            status,
        })
    }

    /// Reset every instance and drive the machine outputs to their safe value.
    fn safe_stop(&mut self) {
        self.components.reset_all();
        self.wiring.collect_outputs(&self.components);
        self.io.write_pump(false);
        self.io.write_machine_off(false);
        let last = self.capture(MachineSnapshot {
            timestamp_us: self.timebase.now_us(),
            pump_relay: false,
            machine_off_request: false,
            ..self.snapshot
        });
        self.exchange.publish_final(last);
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn components(&self) -> &ComponentSet {
        &self.components
    }

    pub fn wiring(&self) -> &Wiring {
        &self.wiring
    }
}

fn saturating_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::hal::{MachineTelemetry, PinValue};
    use crate::hal_sim::{SimProfile, SimulatedMill};
    use crate::idle_shutdown::IdleParams;
    use crate::instance::ParamRef;
    use crate::oiler::{OilerParams, OilerPhase, TriggerCause};
    use crate::sync::ParamRequest;
    use crate::wiring::signal;

    const TICK: Duration = Duration::from_millis(10);

    fn servo(
        profile: SimProfile,
        oiler: OilerParams,
        idle: IdleParams,
    ) -> (ServoThread<SimulatedMill>, Arc<StateExchange>) {
        let mut components = ComponentSet::new();
        components.load_oilers(1, oiler).unwrap();
        components.load_idle_timers(1, idle).unwrap();
        let netlist = Netlist::stock(&components);
        let exchange = Arc::new(StateExchange::new());
        let config = ServoConfig {
            cycle_time: TICK,
            watchdog_timeout: Duration::from_millis(100),
        };
        let servo = ServoThread::new(
            SimulatedMill::new(profile),
            config,
            components,
            &netlist,
            exchange.clone(),
            TimeBase::new(),
        )
        .unwrap();
        (servo, exchange)
    }

    fn run_ticks(servo: &mut ServoThread<SimulatedMill>, ticks: usize) {
        for _ in 0..ticks {
            servo.step(Duration::ZERO).unwrap();
        }
    }

    #[test]
    fn homing_pulses_the_pump_through_the_netlist() {
        let profile = SimProfile {
            homing_time: Duration::from_millis(100),
            program_time: Duration::ZERO,
            ..SimProfile::default()
        };
        let oiler = OilerParams {
            pump_duration: 0.05,
            lockout_duration: 0.1,
            ..OilerParams::default()
        };
        let (mut servo, exchange) = servo(profile, oiler, IdleParams::default());

        run_ticks(&mut servo, 10);
        let snapshot = exchange.read_state();
        assert_eq!(snapshot.oilers()[0].phase, OilerPhase::Pumping);
        assert!(snapshot.pump_relay);
        assert_eq!(snapshot.oilers()[0].last_cause, Some(TriggerCause::Homing));

        run_ticks(&mut servo, 20);
        let snapshot = exchange.read_state();
        assert_eq!(snapshot.oilers()[0].phase, OilerPhase::Idle);
        assert_eq!(snapshot.oilers()[0].pump_cycles, 1);
        assert_eq!(servo.io().pump_pulses(), 1);
        assert_eq!(servo.io().pump_on_time(), TICK * 5);
    }

    #[test]
    fn remote_lube_request_pulses_once() {
        let profile = SimProfile {
            homing_time: Duration::from_secs(60),
            program_time: Duration::ZERO,
            ..SimProfile::default()
        };
        let oiler = OilerParams {
            pump_duration: 0.05,
            lockout_duration: 0.1,
            ..OilerParams::default()
        };
        let (mut servo, exchange) = servo(profile, oiler, IdleParams::default());

        run_ticks(&mut servo, 3);
        assert!(!exchange.read_state().pump_relay);

        exchange.request_manual_lube();
        run_ticks(&mut servo, 1);
        let snapshot = exchange.read_state();
        assert!(snapshot.pump_relay);
        assert_eq!(snapshot.oilers()[0].last_cause, Some(TriggerCause::Manual));

        // The press is released on the next cycle; a request while pumping is ignored.
        exchange.request_manual_lube();
        run_ticks(&mut servo, 30);
        let snapshot = exchange.read_state();
        assert_eq!(snapshot.oilers()[0].pump_cycles, 1);
        assert_eq!(snapshot.oilers()[0].phase, OilerPhase::Idle);

        exchange.request_manual_lube();
        run_ticks(&mut servo, 1);
        assert_eq!(exchange.read_state().oilers()[0].pump_cycles, 2);
    }

    #[test]
    fn idle_machine_is_switched_off() {
        let profile = SimProfile {
            homing_time: Duration::ZERO,
            program_time: Duration::from_millis(200),
            off_delay: Duration::ZERO,
            ..SimProfile::default()
        };
        let (mut servo, exchange) = servo(profile, OilerParams::default(), IdleParams { timeout_s: 1 });

        // 0.2 s of programme then one second idle.
        run_ticks(&mut servo, 118);
        assert!(!exchange.read_state().machine_off_request);
        run_ticks(&mut servo, 1);
        let snapshot = exchange.read_state();
        assert!(snapshot.machine_off_request);
        assert_eq!(snapshot.idle_timers()[0].shutdown_requests, 1);

        run_ticks(&mut servo, 2);
        let snapshot = exchange.read_state();
        assert!(!snapshot.machine_on);
        assert!(!snapshot.machine_off_request);
        assert!(!snapshot.idle_timers()[0].shutdown);
        assert_eq!(
            servo.wiring().bus().get_by_name(signal::MACHINE_OFF),
            Some(PinValue::Bit(false))
        );
    }

    #[test]
    fn applies_and_acknowledges_param_writes() {
        let (mut servo, exchange) =
            servo(SimProfile::default(), OilerParams::default(), IdleParams::default());
        let (target, _) = servo
            .components()
            .find_param("idle-shutdown.0.timeout")
            .unwrap();

        exchange.submit_param_request(ParamRequest {
            sequence: 1,
            target,
            value: PinValue::U32(30),
        });
        run_ticks(&mut servo, 2);
        let snapshot = exchange.read_state();
        assert_eq!(snapshot.param_ack.sequence, 1);
        assert_eq!(snapshot.param_ack.status, ParamAckStatus::Applied);
        assert_eq!(snapshot.idle_timers()[0].timeout_s, 30);

        exchange.submit_param_request(ParamRequest {
            sequence: 2,
            target,
            value: PinValue::U32(0),
        });
        run_ticks(&mut servo, 1);
        let snapshot = exchange.read_state();
        assert_eq!(snapshot.param_ack.status, ParamAckStatus::Rejected);
        assert_eq!(snapshot.idle_timers()[0].timeout_s, 30);
        assert_eq!(servo.stats().params_applied, 1);
        assert_eq!(servo.stats().params_rejected, 1);

        // Slot 0 is oiler-trigger.0; its distance-threshold is read-only.
        let read_only = ParamRef { slot: 0, param: 0 };
        exchange.submit_param_request(ParamRequest {
            sequence: 3,
            target: read_only,
            value: PinValue::Float(1.0),
        });
        run_ticks(&mut servo, 1);
        assert_eq!(exchange.read_state().param_ack.status, ParamAckStatus::Rejected);
        assert_eq!(servo.stats().params_rejected, 2);
    }

    struct FaultyMachine;

    impl MachineIO for FaultyMachine {
        fn step(&mut self, _dt: Duration) {}
        fn read_telemetry(&self) -> MachineTelemetry {
            MachineTelemetry {
                velocity: f32::NAN,
                ..MachineTelemetry::default()
            }
        }
        fn write_pump(&mut self, _on: bool) {}
        fn write_machine_off(&mut self, _requested: bool) {}
        fn is_healthy(&self) -> bool {
            false
        }
    }

    #[test]
    fn unhealthy_io_stops_the_loop() {
        let components = ComponentSet::new();
        let mut servo = ServoThread::new(
            FaultyMachine,
            ServoConfig::default(),
            components,
            &Netlist::default(),
            Arc::new(StateExchange::new()),
            TimeBase::new(),
        )
        .unwrap();
        let stop = AtomicBool::new(false);
        assert_eq!(servo.run(&stop), Err(ServoFault::IoUnhealthy));
    }

    #[test]
    fn stop_flag_resets_instances() {
        let (mut servo, exchange) = servo(
            SimProfile {
                homing_time: Duration::ZERO,
                ..SimProfile::default()
            },
            OilerParams::default(),
            IdleParams::default(),
        );
        run_ticks(&mut servo, 3);
        assert!(exchange.read_state().pump_relay);

        let stop = AtomicBool::new(true);
        assert_eq!(servo.run(&stop), Ok(()));
        assert!(!exchange.read_state().pump_relay);
        for (_, inst) in servo.components().iter() {
            if let Instance::Oiler(oiler) = inst {
                assert_eq!(oiler.state().phase(), OilerPhase::Idle);
                assert!(!oiler.outputs().pump);
            }
        }
        assert_eq!(
            servo.wiring().bus().get_by_name(signal::LUBE_PUMP),
            Some(PinValue::Bit(false))
        );
    }
}
