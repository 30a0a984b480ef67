//! Way-oil pump trigger.
//!
//! Accumulates travel distance and motion time and pulses the pump relay when
//! either crosses its threshold, after a fresh homing, or on a manual request.
//! Every pulse is followed by a lockout during which triggers are ignored.

use crate::hal::{check_input, CyclicComponent, ParamSpec, PinError, PinSpec, PinType, PinValue};
use crate::params::{
    require_non_negative, require_positive, secs, ParamError, ParamSet, Params, Validated,
};
use serde::Serialize;
use std::time::Duration;

/// Velocity magnitude at or below which the machine counts as stationary.
pub const MOTION_EPSILON: f32 = 1e-6;

pub mod pin {
    pub const POSITION_X: usize = 0;
    pub const POSITION_Y: usize = 1;
    pub const POSITION_Z: usize = 2;
    pub const VELOCITY: usize = 3;
    pub const ALL_HOMED: usize = 4;
    pub const MANUAL_TRIGGER: usize = 5;
    pub const PUMP: usize = 6;
}

pub mod param {
    pub const DISTANCE_THRESHOLD: usize = 0;
    pub const TIME_THRESHOLD: usize = 1;
    pub const PUMP_DURATION: usize = 2;
    pub const LOCKOUT_DURATION: usize = 3;
    pub const PHASE: usize = 4;
    pub const DISTANCE_ACCUMULATED: usize = 5;
    pub const MOTION_TIME: usize = 6;
    pub const PHASE_REMAINING: usize = 7;
    pub const PUMP_CYCLES: usize = 8;
}

static PINS: [PinSpec; 7] = [
    PinSpec::input("position-x", PinType::Float),
    PinSpec::input("position-y", PinType::Float),
    PinSpec::input("position-z", PinType::Float),
    PinSpec::input("velocity", PinType::Float),
    PinSpec::input("all-homed", PinType::Bit),
    PinSpec::input("manual-trigger", PinType::Bit),
    PinSpec::output("pump", PinType::Bit),
];

static PARAMS: [ParamSpec; 9] = [
    ParamSpec::read_only("distance-threshold", PinType::Float),
    ParamSpec::read_only("time-threshold", PinType::Float),
    ParamSpec::read_only("pump-duration", PinType::Float),
    ParamSpec::read_only("lockout-duration", PinType::Float),
    ParamSpec::read_only("phase", PinType::U32),
    ParamSpec::read_only("distance-accumulated", PinType::Float),
    ParamSpec::read_only("motion-time", PinType::Float),
    ParamSpec::read_only("phase-remaining", PinType::Float),
    ParamSpec::read_only("pump-cycles", PinType::U32),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OilerParams {
    /// Machine-length units of travel between pulses.
    pub distance_threshold: f32,
    /// Seconds of motion between pulses.
    pub time_threshold: f32,
    pub pump_duration: f32,
    pub lockout_duration: f32,
}

impl Default for OilerParams {
    fn default() -> Self {
        Self {
            distance_threshold: 5000.0,
            time_threshold: 1800.0,
            pump_duration: 2.0,
            lockout_duration: 60.0,
        }
    }
}

impl ParamSet for OilerParams {
    fn check(&self) -> Result<(), ParamError> {
        require_positive("distance-threshold", f64::from(self.distance_threshold))?;
        require_positive("time-threshold", f64::from(self.time_threshold))?;
        require_non_negative("pump-duration", f64::from(self.pump_duration))?;
        require_non_negative("lockout-duration", f64::from(self.lockout_duration))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OilerPhase {
    #[default]
    Idle,
    Pumping,
    Lockout,
}

impl OilerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pumping => "pumping",
            Self::Lockout => "lockout",
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Idle => 0,
            Self::Pumping => 1,
            Self::Lockout => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    Distance,
    MotionTime,
    Homing,
    Manual,
}

impl TriggerCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distance => "distance",
            Self::MotionTime => "motion_time",
            Self::Homing => "homing",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OilerInputs {
    pub position: [f32; 3],
    pub velocity: f32,
    pub all_homed: bool,
    pub manual_trigger: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OilerOutputs {
    pub pump: bool,
    /// Set on the tick that entered `Pumping`.
    pub fired: Option<TriggerCause>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OilerState {
    last_position: Option<[f32; 3]>,
    distance: f64,
    motion_time: Duration,
    phase: OilerPhase,
    phase_remaining: Duration,
    prev_homed: bool,
    prev_manual: bool,
    homing_fired: bool,
}

impl OilerState {
    pub fn phase(&self) -> OilerPhase {
        self.phase
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn motion_time(&self) -> Duration {
        self.motion_time
    }

    pub fn phase_remaining(&self) -> Duration {
        self.phase_remaining
    }

    fn accumulate(&mut self, inputs: &OilerInputs, dt: Duration) {
        let position = inputs.position;
        if inputs.velocity.abs() > MOTION_EPSILON {
            if let Some(last) = self.last_position {
                let step = euclidean(last, position);
                if step.is_finite() {
                    self.distance += step;
                }
            }
            self.motion_time = self.motion_time.saturating_add(dt);
        }
        if position.iter().all(|v| v.is_finite()) {
            self.last_position = Some(position);
        }
    }

    fn trigger_cause(
        &self,
        params: &OilerParams,
        homed_edge: bool,
        manual_edge: bool,
    ) -> Option<TriggerCause> {
        if self.distance >= f64::from(params.distance_threshold) {
            Some(TriggerCause::Distance)
        } else if self.motion_time >= secs(params.time_threshold) {
            Some(TriggerCause::MotionTime)
        } else if homed_edge && !self.homing_fired {
            Some(TriggerCause::Homing)
        } else if manual_edge {
            Some(TriggerCause::Manual)
        } else {
            None
        }
    }
}

fn euclidean(a: [f32; 3], b: [f32; 3]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(p, q)| {
            let d = f64::from(*q) - f64::from(*p);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Advance one oiler instance by a single tick of `dt`.
pub fn advance(
    state: &mut OilerState,
    params: &OilerParams,
    inputs: &OilerInputs,
    dt: Duration,
) -> OilerOutputs {
    state.accumulate(inputs, dt);

    let manual_edge = inputs.manual_trigger && !state.prev_manual;
    let homed_edge = inputs.all_homed && !state.prev_homed;
    if state.prev_homed && !inputs.all_homed {
        state.homing_fired = false;
    }
    state.prev_homed = inputs.all_homed;
    state.prev_manual = inputs.manual_trigger;

    let mut fired = None;
    match state.phase {
        OilerPhase::Idle => {
            if let Some(cause) = state.trigger_cause(params, homed_edge, manual_edge) {
                state.distance = 0.0;
                state.motion_time = Duration::ZERO;
                // Cleared only when all-homed falls.
                state.homing_fired = true;
                state.phase = OilerPhase::Pumping;
                state.phase_remaining = secs(params.pump_duration);
                fired = Some(cause);
            }
        }
        OilerPhase::Pumping => {
            state.phase_remaining = state.phase_remaining.saturating_sub(dt);
            if state.phase_remaining.is_zero() {
                state.phase = OilerPhase::Lockout;
                state.phase_remaining = secs(params.lockout_duration);
            }
        }
        OilerPhase::Lockout => {
            state.phase_remaining = state.phase_remaining.saturating_sub(dt);
            if state.phase_remaining.is_zero() {
                state.phase = OilerPhase::Idle;
            }
        }
    }

    OilerOutputs {
        pump: state.phase == OilerPhase::Pumping,
        fired,
    }
}

/// Pin-addressable oiler instance.
#[derive(Debug, Clone)]
pub struct OilerTrigger {
    settings: Params<OilerParams, Validated>,
    state: OilerState,
    inputs: OilerInputs,
    outputs: OilerOutputs,
    pump_cycles: u32,
}

impl OilerTrigger {
    pub fn new(settings: Params<OilerParams, Validated>) -> Self {
        Self {
            settings,
            state: OilerState::default(),
            inputs: OilerInputs::default(),
            outputs: OilerOutputs::default(),
            pump_cycles: 0,
        }
    }

    pub fn settings(&self) -> &OilerParams {
        self.settings.get()
    }

    pub fn state(&self) -> &OilerState {
        &self.state
    }

    pub fn set_inputs(&mut self, inputs: OilerInputs) {
        self.inputs = inputs;
    }

    pub fn outputs(&self) -> OilerOutputs {
        self.outputs
    }

    pub fn pump_cycles(&self) -> u32 {
        self.pump_cycles
    }
}

impl CyclicComponent for OilerTrigger {
    fn pins(&self) -> &'static [PinSpec] {
        &PINS
    }

    fn params(&self) -> &'static [ParamSpec] {
        &PARAMS
    }

    fn read_pin(&self, idx: usize) -> Option<PinValue> {
        let value = match idx {
            pin::POSITION_X | pin::POSITION_Y | pin::POSITION_Z => {
                PinValue::Float(self.inputs.position[idx - pin::POSITION_X])
            }
            pin::VELOCITY => PinValue::Float(self.inputs.velocity),
            pin::ALL_HOMED => PinValue::Bit(self.inputs.all_homed),
            pin::MANUAL_TRIGGER => PinValue::Bit(self.inputs.manual_trigger),
            pin::PUMP => PinValue::Bit(self.outputs.pump),
            _ => return None,
        };
        Some(value)
    }

    fn write_pin(&mut self, idx: usize, value: PinValue) -> Result<(), PinError> {
        check_input(&PINS, idx, value)?;
        match idx {
            pin::POSITION_X | pin::POSITION_Y | pin::POSITION_Z => {
                self.inputs.position[idx - pin::POSITION_X] = value.as_f32();
            }
            pin::VELOCITY => self.inputs.velocity = value.as_f32(),
            pin::ALL_HOMED => self.inputs.all_homed = value.as_bit(),
            pin::MANUAL_TRIGGER => self.inputs.manual_trigger = value.as_bit(),
            _ => {}
        }
        Ok(())
    }

    fn read_param(&self, idx: usize) -> Option<PinValue> {
        let p = self.settings.get();
        let value = match idx {
            param::DISTANCE_THRESHOLD => PinValue::Float(p.distance_threshold),
            param::TIME_THRESHOLD => PinValue::Float(p.time_threshold),
            param::PUMP_DURATION => PinValue::Float(p.pump_duration),
            param::LOCKOUT_DURATION => PinValue::Float(p.lockout_duration),
            param::PHASE => PinValue::U32(self.state.phase.code()),
            param::DISTANCE_ACCUMULATED => PinValue::Float(self.state.distance as f32),
            param::MOTION_TIME => PinValue::Float(self.state.motion_time.as_secs_f32()),
            param::PHASE_REMAINING => PinValue::Float(self.state.phase_remaining.as_secs_f32()),
            param::PUMP_CYCLES => PinValue::U32(self.pump_cycles),
            _ => return None,
        };
        Some(value)
    }

    fn write_param(&mut self, idx: usize, _value: PinValue) -> Result<(), ParamError> {
        let spec = PARAMS.get(idx).ok_or(ParamError::NoSuchParam(idx))?;
        Err(ParamError::ReadOnly { name: spec.name })
    }

    fn update(&mut self, period: Duration) {
        self.outputs = advance(&mut self.state, self.settings.get(), &self.inputs, period);
        if self.outputs.fired.is_some() {
            self.pump_cycles = self.pump_cycles.wrapping_add(1);
        }
    }

    fn reset(&mut self) {
        self.state = OilerState::default();
        self.inputs = OilerInputs::default();
        self.outputs = OilerOutputs::default();
    }
}
