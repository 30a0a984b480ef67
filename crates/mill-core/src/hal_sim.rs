use crate::hal::{MachineIO, MachineTelemetry};
use std::time::Duration;

/// Script for the simulated machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimProfile {
    /// Delay after power-on before all axes report homed.
    pub homing_time: Duration,
    /// Length of the programme that runs once homed.
    pub program_time: Duration,
    /// Feed rate of the programme in machine units per second.
    pub feed_rate: f32,
    /// Radius of the circular toolpath.
    pub radius: f32,
    /// Delay between a machine-off request and power actually dropping.
    pub off_delay: Duration,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            homing_time: Duration::from_secs(2),
            program_time: Duration::from_secs(30),
            feed_rate: 50.0,
            radius: 40.0,
            off_delay: Duration::from_millis(50),
        }
    }
}

/// Simulated three-axis mill: powers on, homes, runs a circular programme
/// with the spindle on, then sits idle until told to switch off.
#[derive(Debug, Clone)]
pub struct SimulatedMill {
    profile: SimProfile,
    powered_for: Duration,
    off_requested_for: Option<Duration>,
    telemetry: MachineTelemetry,
    angle: f64,
    pump_on: bool,
    pump_pulses: u64,
    pump_on_time: Duration,
}

impl SimulatedMill {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            powered_for: Duration::ZERO,
            off_requested_for: None,
            telemetry: MachineTelemetry {
                machine_on: true,
                ..MachineTelemetry::default()
            },
            angle: 0.0,
            pump_on: false,
            pump_pulses: 0,
            pump_on_time: Duration::ZERO,
        }
    }

    pub fn pump_pulses(&self) -> u64 {
        self.pump_pulses
    }

    pub fn pump_on_time(&self) -> Duration {
        self.pump_on_time
    }

    /// Power the machine back on, as an operator would.
    pub fn power_on(&mut self) {
        self.telemetry = MachineTelemetry {
            machine_on: true,
            position: self.telemetry.position,
            ..MachineTelemetry::default()
        };
        self.powered_for = Duration::ZERO;
        self.off_requested_for = None;
    }

    fn power_off(&mut self) {
        self.telemetry = MachineTelemetry {
            position: self.telemetry.position,
            ..MachineTelemetry::default()
        };
        self.off_requested_for = None;
    }

    fn run_program(&mut self, dt: Duration) {
        let radius = f64::from(self.profile.radius.max(f32::EPSILON));
        let feed = f64::from(self.profile.feed_rate);
        self.angle = (self.angle + feed * dt.as_secs_f64() / radius) % std::f64::consts::TAU;
        self.telemetry.position = [
            (radius * self.angle.cos()) as f32,
            (radius * self.angle.sin()) as f32,
            self.telemetry.position[2],
        ];
        self.telemetry.velocity = self.profile.feed_rate;
        self.telemetry.program_running = true;
        self.telemetry.spindle_on = true;
    }
}

impl Default for SimulatedMill {
    fn default() -> Self {
        Self::new(SimProfile::default())
    }
}

impl MachineIO for SimulatedMill {
    fn step(&mut self, dt: Duration) {
        if self.pump_on {
            self.pump_on_time += dt;
        }
        if !self.telemetry.machine_on {
            return;
        }

        if let Some(waited) = self.off_requested_for.as_mut() {
            *waited += dt;
            if *waited >= self.profile.off_delay {
                self.power_off();
                return;
            }
        }

        self.powered_for += dt;
        self.telemetry.all_homed = self.powered_for >= self.profile.homing_time;
        let program_end = self.profile.homing_time + self.profile.program_time;
        if self.telemetry.all_homed && self.powered_for < program_end {
            self.run_program(dt);
        } else {
            self.telemetry.velocity = 0.0;
            self.telemetry.program_running = false;
            self.telemetry.spindle_on = false;
        }
    }

    fn read_telemetry(&self) -> MachineTelemetry {
        self.telemetry
    }

    fn write_pump(&mut self, on: bool) {
        if on && !self.pump_on {
            self.pump_pulses += 1;
        }
        self.pump_on = on;
    }

    fn write_machine_off(&mut self, requested: bool) {
        if !requested {
            return;
        }
        if self.telemetry.machine_on && self.off_requested_for.is_none() {
            self.off_requested_for = Some(Duration::ZERO);
        }
    }

    fn is_healthy(&self) -> bool {
        self.telemetry.position.iter().all(|v| v.is_finite()) && self.telemetry.velocity.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    fn run_for(mill: &mut SimulatedMill, time: Duration) {
        let ticks = time.as_millis() / TICK.as_millis();
        for _ in 0..ticks {
            mill.step(TICK);
        }
    }

    #[test]
    fn homes_then_runs_then_idles() {
        let profile = SimProfile {
            homing_time: Duration::from_secs(1),
            program_time: Duration::from_secs(2),
            ..SimProfile::default()
        };
        let mut mill = SimulatedMill::new(profile);
        run_for(&mut mill, Duration::from_millis(500));
        assert!(!mill.read_telemetry().all_homed);

        run_for(&mut mill, Duration::from_secs(1));
        let t = mill.read_telemetry();
        assert!(t.all_homed && t.program_running && t.spindle_on);
        assert!(t.velocity > 0.0);

        run_for(&mut mill, Duration::from_secs(2));
        let t = mill.read_telemetry();
        assert!(!t.program_running);
        assert_eq!(t.velocity, 0.0);
        assert!(t.machine_on);
        assert!(mill.is_healthy());
    }

    #[test]
    fn toolpath_stays_on_circle() {
        let mut mill = SimulatedMill::new(SimProfile {
            homing_time: Duration::ZERO,
            ..SimProfile::default()
        });
        run_for(&mut mill, Duration::from_secs(3));
        let [x, y, _] = mill.read_telemetry().position;
        let r = (x * x + y * y).sqrt();
        assert!((r - 40.0).abs() < 1e-3);
    }

    #[test]
    fn machine_off_drops_power_after_delay() {
        let mut mill = SimulatedMill::default();
        mill.step(TICK);
        mill.write_machine_off(true);
        mill.step(TICK);
        assert!(mill.read_telemetry().machine_on);
        run_for(&mut mill, Duration::from_millis(100));
        assert!(!mill.read_telemetry().machine_on);

        mill.power_on();
        mill.step(TICK);
        assert!(mill.read_telemetry().machine_on);
        assert!(!mill.read_telemetry().all_homed);
    }

    #[test]
    fn counts_pump_pulses() {
        let mut mill = SimulatedMill::default();
        mill.write_pump(true);
        mill.step(TICK);
        mill.write_pump(true);
        mill.step(TICK);
        mill.write_pump(false);
        mill.write_pump(true);
        assert_eq!(mill.pump_pulses(), 2);
        assert_eq!(mill.pump_on_time(), TICK * 2);
    }
}
