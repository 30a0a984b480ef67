use crate::params::ParamError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Scalar type carried by a pin, parameter or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinType {
    Bit,
    Float,
    U32,
}

impl PinType {
    pub fn zero(self) -> PinValue {
        match self {
            Self::Bit => PinValue::Bit(false),
            Self::Float => PinValue::Float(0.0),
            Self::U32 => PinValue::U32(0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::Float => "float",
            Self::U32 => "u32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PinValue {
    Bit(bool),
    Float(f32),
    U32(u32),
}

impl PinValue {
    pub fn ty(&self) -> PinType {
        match self {
            Self::Bit(_) => PinType::Bit,
            Self::Float(_) => PinType::Float,
            Self::U32(_) => PinType::U32,
        }
    }

    /// Bit view; other types read as "non-zero".
    pub fn as_bit(&self) -> bool {
        match *self {
            Self::Bit(v) => v,
            Self::Float(v) => v != 0.0,
            Self::U32(v) => v != 0,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            Self::Bit(v) => f32::from(u8::from(v)),
            Self::Float(v) => v,
            Self::U32(v) => v as f32,
        }
    }

    pub fn as_u32(&self) -> u32 {
        match *self {
            Self::Bit(v) => u32::from(v),
            // Saturating float-to-int cast; NaN maps to 0.
            Self::Float(v) => v as u32,
            Self::U32(v) => v,
        }
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bit(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinDir {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamAccess {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub struct PinSpec {
    pub name: &'static str,
    pub dir: PinDir,
    pub ty: PinType,
}

impl PinSpec {
    pub const fn input(name: &'static str, ty: PinType) -> Self {
        Self {
            name,
            dir: PinDir::In,
            ty,
        }
    }

    pub const fn output(name: &'static str, ty: PinType) -> Self {
        Self {
            name,
            dir: PinDir::Out,
            ty,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: PinType,
    pub access: ParamAccess,
}

impl ParamSpec {
    pub const fn read_only(name: &'static str, ty: PinType) -> Self {
        Self {
            name,
            ty,
            access: ParamAccess::ReadOnly,
        }
    }

    pub const fn read_write(name: &'static str, ty: PinType) -> Self {
        Self {
            name,
            ty,
            access: ParamAccess::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PinError {
    #[error("pin index {0} out of range")]
    NoSuchPin(usize),
    #[error("pin '{name}' is an output and cannot be written externally")]
    NotAnInput { name: &'static str },
    #[error("pin '{name}' expects {expected}, got {got}")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
        got: &'static str,
    },
}

pub(crate) fn check_input(
    pins: &'static [PinSpec],
    idx: usize,
    value: PinValue,
) -> Result<&'static PinSpec, PinError> {
    let spec = pins.get(idx).ok_or(PinError::NoSuchPin(idx))?;
    if spec.dir != PinDir::In {
        return Err(PinError::NotAnInput { name: spec.name });
    }
    if spec.ty != value.ty() {
        return Err(PinError::TypeMismatch {
            name: spec.name,
            expected: spec.ty.as_str(),
            got: value.ty().as_str(),
        });
    }
    Ok(spec)
}

/// A stateful function re-invoked once per servo period.
///
/// Pins and parameters are addressed by their index in the static tables
/// returned from [`CyclicComponent::pins`] and [`CyclicComponent::params`] so
/// the per-cycle path never performs name lookups.
pub trait CyclicComponent: Send {
    fn pins(&self) -> &'static [PinSpec];
    fn params(&self) -> &'static [ParamSpec];
    fn read_pin(&self, idx: usize) -> Option<PinValue>;
    fn write_pin(&mut self, idx: usize, value: PinValue) -> Result<(), PinError>;
    fn read_param(&self, idx: usize) -> Option<PinValue>;
    fn write_param(&mut self, idx: usize, value: PinValue) -> Result<(), ParamError>;
    /// Advance exactly one tick of `period`.
    fn update(&mut self, period: Duration);
    /// Return to load-time state with every output at its safe value.
    fn reset(&mut self);
}

/// Machine-side telemetry as produced by the motion controller.
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct MachineTelemetry {
    pub position: [f32; 3],
    pub velocity: f32,
    pub all_homed: bool,
    pub program_running: bool,
    pub program_paused: bool,
    pub spindle_on: bool,
    pub machine_on: bool,
    /// Operator "lube now" request, held for as long as it is pressed.
    pub manual_lube: bool,
}

pub trait MachineIO: Send {
    fn step(&mut self, dt: Duration);
    fn read_telemetry(&self) -> MachineTelemetry;
    fn write_pump(&mut self, on: bool);
    fn write_machine_off(&mut self, requested: bool);
    fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    static PINS: [PinSpec; 2] = [
        PinSpec::input("in", PinType::Float),
        PinSpec::output("out", PinType::Bit),
    ];

    #[test]
    fn zero_values_match_type() {
        assert_eq!(PinType::Bit.zero(), PinValue::Bit(false));
        assert_eq!(PinType::Float.zero(), PinValue::Float(0.0));
        assert_eq!(PinType::U32.zero(), PinValue::U32(0));
    }

    #[test]
    fn float_to_u32_saturates() {
        assert_eq!(PinValue::Float(-3.0).as_u32(), 0);
        assert_eq!(PinValue::Float(f32::NAN).as_u32(), 0);
        assert_eq!(PinValue::Float(12.7).as_u32(), 12);
    }

    #[test]
    fn rejects_writes_to_outputs_and_wrong_types() {
        assert!(check_input(&PINS, 0, PinValue::Float(1.0)).is_ok());
        assert!(matches!(
            check_input(&PINS, 1, PinValue::Bit(true)),
            Err(PinError::NotAnInput { name: "out" })
        ));
        assert!(matches!(
            check_input(&PINS, 0, PinValue::Bit(true)),
            Err(PinError::TypeMismatch { .. })
        ));
        assert_eq!(
            check_input(&PINS, 9, PinValue::Bit(true)).unwrap_err(),
            PinError::NoSuchPin(9)
        );
    }
}
