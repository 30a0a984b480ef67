//! Machine-off request after a period of inactivity.

use crate::hal::{check_input, CyclicComponent, ParamSpec, PinError, PinSpec, PinType, PinValue};
use crate::oiler::MOTION_EPSILON;
use crate::params::{require_positive, ParamError, ParamSet, Params, Validated};
use std::time::Duration;

pub mod pin {
    pub const VELOCITY: usize = 0;
    pub const PROGRAM_RUNNING: usize = 1;
    pub const PROGRAM_PAUSED: usize = 2;
    pub const SPINDLE_ON: usize = 3;
    pub const USER_ACTIVITY: usize = 4;
    pub const MACHINE_ON: usize = 5;
    pub const SHUTDOWN: usize = 6;
    pub const IDLE: usize = 7;
}

pub mod param {
    pub const TIMEOUT: usize = 0;
    pub const IDLE_ELAPSED: usize = 1;
    pub const SHUTDOWN_REQUESTS: usize = 2;
}

static PINS: [PinSpec; 8] = [
    PinSpec::input("velocity", PinType::Float),
    PinSpec::input("program-running", PinType::Bit),
    PinSpec::input("program-paused", PinType::Bit),
    PinSpec::input("spindle-on", PinType::Bit),
    PinSpec::input("user-activity", PinType::Bit),
    PinSpec::input("machine-on", PinType::Bit),
    PinSpec::output("shutdown", PinType::Bit),
    PinSpec::output("idle", PinType::Bit),
];

static PARAMS: [ParamSpec; 3] = [
    ParamSpec::read_write("timeout", PinType::U32),
    ParamSpec::read_only("idle-elapsed", PinType::U32),
    ParamSpec::read_only("shutdown-requests", PinType::U32),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleParams {
    /// Whole seconds of inactivity before machine-off is requested.
    pub timeout_s: u32,
}

impl Default for IdleParams {
    fn default() -> Self {
        Self { timeout_s: 900 }
    }
}

impl ParamSet for IdleParams {
    fn check(&self) -> Result<(), ParamError> {
        require_positive("timeout", f64::from(self.timeout_s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdleInputs {
    pub velocity: f32,
    pub program_running: bool,
    pub program_paused: bool,
    pub spindle_on: bool,
    /// Not driven by the stock netlist; reads false when unconnected.
    pub user_activity: bool,
    pub machine_on: bool,
}

impl IdleInputs {
    /// A paused program counts as activity so a job is never cut off mid-way.
    pub fn is_active(&self) -> bool {
        self.velocity.abs() > MOTION_EPSILON
            || self.program_running
            || self.program_paused
            || self.spindle_on
            || self.user_activity
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleOutputs {
    pub shutdown: bool,
    pub idle: bool,
    /// Set on the tick shutdown went from false to true.
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleState {
    idle_elapsed: Duration,
    prev_machine_on: bool,
    shutdown: bool,
}

impl IdleState {
    pub fn idle_elapsed(&self) -> Duration {
        self.idle_elapsed
    }

    /// Whole elapsed seconds, saturating at `u32::MAX`.
    pub fn idle_elapsed_secs(&self) -> u32 {
        u32::try_from(self.idle_elapsed.as_secs()).unwrap_or(u32::MAX)
    }

    pub fn machine_on(&self) -> bool {
        self.prev_machine_on
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown
    }
}

/// Advance one idle timer by a single tick of `dt`.
pub fn advance(
    state: &mut IdleState,
    params: &IdleParams,
    inputs: &IdleInputs,
    dt: Duration,
) -> IdleOutputs {
    let powered_on = inputs.machine_on && !state.prev_machine_on;
    state.prev_machine_on = inputs.machine_on;

    if !inputs.machine_on || powered_on {
        state.idle_elapsed = Duration::ZERO;
        state.shutdown = false;
    }
    if !inputs.machine_on {
        return IdleOutputs::default();
    }

    let mut idle = false;
    let mut timed_out = false;
    if inputs.is_active() {
        state.idle_elapsed = Duration::ZERO;
    } else {
        state.idle_elapsed = state.idle_elapsed.saturating_add(dt);
        if state.idle_elapsed >= Duration::from_secs(u64::from(params.timeout_s)) {
            idle = true;
            timed_out = !state.shutdown;
            state.shutdown = true;
        }
    }

    IdleOutputs {
        shutdown: state.shutdown,
        idle,
        timed_out,
    }
}

/// Pin-addressable idle timer instance.
#[derive(Debug, Clone)]
pub struct IdleShutdownTimer {
    settings: Params<IdleParams, Validated>,
    state: IdleState,
    inputs: IdleInputs,
    outputs: IdleOutputs,
    shutdown_requests: u32,
}

impl IdleShutdownTimer {
    pub fn new(settings: Params<IdleParams, Validated>) -> Self {
        Self {
            settings,
            state: IdleState::default(),
            inputs: IdleInputs::default(),
            outputs: IdleOutputs::default(),
            shutdown_requests: 0,
        }
    }

    pub fn settings(&self) -> &IdleParams {
        self.settings.get()
    }

    pub fn state(&self) -> &IdleState {
        &self.state
    }

    pub fn set_inputs(&mut self, inputs: IdleInputs) {
        self.inputs = inputs;
    }

    pub fn outputs(&self) -> IdleOutputs {
        self.outputs
    }

    pub fn shutdown_requests(&self) -> u32 {
        self.shutdown_requests
    }
}

impl CyclicComponent for IdleShutdownTimer {
    fn pins(&self) -> &'static [PinSpec] {
        &PINS
    }

    fn params(&self) -> &'static [ParamSpec] {
        &PARAMS
    }

    fn read_pin(&self, idx: usize) -> Option<PinValue> {
        let value = match idx {
            pin::VELOCITY => PinValue::Float(self.inputs.velocity),
            pin::PROGRAM_RUNNING => PinValue::Bit(self.inputs.program_running),
            pin::PROGRAM_PAUSED => PinValue::Bit(self.inputs.program_paused),
            pin::SPINDLE_ON => PinValue::Bit(self.inputs.spindle_on),
            pin::USER_ACTIVITY => PinValue::Bit(self.inputs.user_activity),
            pin::MACHINE_ON => PinValue::Bit(self.inputs.machine_on),
            pin::SHUTDOWN => PinValue::Bit(self.outputs.shutdown),
            pin::IDLE => PinValue::Bit(self.outputs.idle),
            _ => return None,
        };
        Some(value)
    }

    fn write_pin(&mut self, idx: usize, value: PinValue) -> Result<(), PinError> {
        check_input(&PINS, idx, value)?;
        let bit = value.as_bit();
        match idx {
            pin::VELOCITY => self.inputs.velocity = value.as_f32(),
            pin::PROGRAM_RUNNING => self.inputs.program_running = bit,
            pin::PROGRAM_PAUSED => self.inputs.program_paused = bit,
            pin::SPINDLE_ON => self.inputs.spindle_on = bit,
            pin::USER_ACTIVITY => self.inputs.user_activity = bit,
            pin::MACHINE_ON => self.inputs.machine_on = bit,
            _ => {}
        }
        Ok(())
    }

    fn read_param(&self, idx: usize) -> Option<PinValue> {
        let value = match idx {
            param::TIMEOUT => PinValue::U32(self.settings.get().timeout_s),
            param::IDLE_ELAPSED => PinValue::U32(self.state.idle_elapsed_secs()),
            param::SHUTDOWN_REQUESTS => PinValue::U32(self.shutdown_requests),
            _ => return None,
        };
        Some(value)
    }

    fn write_param(&mut self, idx: usize, value: PinValue) -> Result<(), ParamError> {
        let spec = PARAMS.get(idx).ok_or(ParamError::NoSuchParam(idx))?;
        if idx != param::TIMEOUT {
            return Err(ParamError::ReadOnly { name: spec.name });
        }
        let PinValue::U32(timeout_s) = value else {
            return Err(ParamError::TypeMismatch {
                name: spec.name,
                expected: spec.ty.as_str(),
            });
        };
        self.settings.update(|p| p.timeout_s = timeout_s)
    }

    fn update(&mut self, period: Duration) {
        self.outputs = advance(&mut self.state, self.settings.get(), &self.inputs, period);
        if self.outputs.timed_out {
            self.shutdown_requests = self.shutdown_requests.wrapping_add(1);
        }
    }

    fn reset(&mut self) {
        self.state = IdleState::default();
        self.inputs = IdleInputs::default();
        self.outputs = IdleOutputs::default();
    }
}
