//! Signal bus and netlist resolution.
//!
//! A netlist binds fully-qualified pin names to named signals. It is resolved
//! once at start-up into index links so the per-cycle copy between the bus
//! and component pins does no lookups and no allocation.

use crate::hal::{CyclicComponent, MachineTelemetry, PinDir, PinType, PinValue};
use crate::instance::{ComponentKind, ComponentSet, PinRef};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub type SignalId = usize;

/// Names of the signals driven or read by the machine itself.
pub mod signal {
    pub const AXIS_X_POS: &str = "axis-x-pos";
    pub const AXIS_Y_POS: &str = "axis-y-pos";
    pub const AXIS_Z_POS: &str = "axis-z-pos";
    pub const MOTION_VELOCITY: &str = "motion-velocity";
    pub const ALL_HOMED: &str = "all-homed";
    pub const PROGRAM_RUNNING: &str = "program-running";
    pub const PROGRAM_PAUSED: &str = "program-paused";
    pub const SPINDLE_ON: &str = "spindle-on";
    pub const MACHINE_IS_ON: &str = "machine-is-on";
    pub const LUBE_PUMP: &str = "lube-pump";
    pub const MACHINE_OFF: &str = "machine-off";
    pub const MACHINE_IDLE: &str = "machine-idle";
    pub const MANUAL_LUBE: &str = "manual-lube";
}

const MACHINE_WRITER: &str = "<machine>";

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("unknown pin '{0}'")]
    UnknownPin(String),
    #[error("pin '{0}' is bound to more than one signal")]
    PinAlreadyLinked(String),
    #[error("signal '{signal}' is {expected} but '{pin}' is {got}")]
    TypeMismatch {
        signal: String,
        pin: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("signal '{signal}' already driven by '{first}', cannot add '{second}'")]
    MultipleWriters {
        signal: String,
        first: String,
        second: String,
    },
    #[error("failed to parse netlist: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read netlist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
struct Signal {
    name: String,
    ty: PinType,
    value: PinValue,
    writer: Option<String>,
}

/// Named signals. A signal nobody writes reads as its type's zero.
#[derive(Debug, Clone, Default)]
pub struct SignalBus {
    signals: Vec<Signal>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create a signal; an existing signal must have the same type.
    pub fn declare(&mut self, name: &str, ty: PinType, pin: &str) -> Result<SignalId, WiringError> {
        if let Some(id) = self.find(name) {
            let existing = self.signals[id].ty;
            if existing != ty {
                return Err(WiringError::TypeMismatch {
                    signal: name.to_string(),
                    pin: pin.to_string(),
                    expected: existing.as_str(),
                    got: ty.as_str(),
                });
            }
            return Ok(id);
        }
        self.signals.push(Signal {
            name: name.to_string(),
            ty,
            value: ty.zero(),
            writer: None,
        });
        Ok(self.signals.len() - 1)
    }

    /// Record `writer` as the single driver of `id`.
    pub fn claim_writer(&mut self, id: SignalId, writer: &str) -> Result<(), WiringError> {
        let Some(signal) = self.signals.get_mut(id) else {
            return Ok(());
        };
        if let Some(first) = &signal.writer {
            return Err(WiringError::MultipleWriters {
                signal: signal.name.clone(),
                first: first.clone(),
                second: writer.to_string(),
            });
        }
        signal.writer = Some(writer.to_string());
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<SignalId> {
        self.signals.iter().position(|s| s.name == name)
    }

    pub fn get(&self, id: SignalId) -> Option<PinValue> {
        self.signals.get(id).map(|s| s.value)
    }

    pub fn get_by_name(&self, name: &str) -> Option<PinValue> {
        self.find(name).and_then(|id| self.get(id))
    }

    /// Store `value`, converted to the signal's declared type.
    pub fn set(&mut self, id: SignalId, value: PinValue) {
        if let Some(signal) = self.signals.get_mut(id) {
            signal.value = match signal.ty {
                PinType::Bit => PinValue::Bit(value.as_bit()),
                PinType::Float => PinValue::Float(value.as_f32()),
                PinType::U32 => PinValue::U32(value.as_u32()),
            };
        }
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.iter().map(|s| s.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetDecl {
    pub signal: String,
    pub pins: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Netlist {
    pub nets: Vec<NetDecl>,
}

impl Netlist {
    pub fn from_json_str(raw: &str) -> Result<Self, WiringError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, WiringError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WiringError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Add `pin` to `signal`, creating the net on first use.
    pub fn bind(&mut self, signal: &str, pin: impl Into<String>) {
        let pin = pin.into();
        match self.nets.iter_mut().find(|n| n.signal == signal) {
            Some(net) => net.pins.push(pin),
            None => self.nets.push(NetDecl {
                signal: signal.to_string(),
                pins: vec![pin],
            }),
        }
    }

    /// Default wiring for every loaded instance. Instance 0 drives the
    /// machine-facing signals; further instances get numbered signals of
    /// their own so each signal keeps a single writer.
    pub fn stock(components: &ComponentSet) -> Self {
        let mut netlist = Self::default();
        for (id, _) in components.iter() {
            let prefix = id.to_string();
            let suffixed = |base: &str| {
                if id.index == 0 {
                    base.to_string()
                } else {
                    format!("{base}-{}", id.index)
                }
            };
            match id.kind {
                ComponentKind::OilerTrigger => {
                    netlist.bind(signal::AXIS_X_POS, format!("{prefix}.position-x"));
                    netlist.bind(signal::AXIS_Y_POS, format!("{prefix}.position-y"));
                    netlist.bind(signal::AXIS_Z_POS, format!("{prefix}.position-z"));
                    netlist.bind(signal::MOTION_VELOCITY, format!("{prefix}.velocity"));
                    netlist.bind(signal::ALL_HOMED, format!("{prefix}.all-homed"));
                    netlist.bind(signal::MANUAL_LUBE, format!("{prefix}.manual-trigger"));
                    netlist.bind(&suffixed(signal::LUBE_PUMP), format!("{prefix}.pump"));
                }
                ComponentKind::IdleShutdown => {
                    netlist.bind(signal::MOTION_VELOCITY, format!("{prefix}.velocity"));
                    netlist.bind(signal::PROGRAM_RUNNING, format!("{prefix}.program-running"));
                    netlist.bind(signal::PROGRAM_PAUSED, format!("{prefix}.program-paused"));
                    netlist.bind(signal::SPINDLE_ON, format!("{prefix}.spindle-on"));
                    netlist.bind(signal::MACHINE_IS_ON, format!("{prefix}.machine-on"));
                    netlist.bind(&suffixed(signal::MACHINE_OFF), format!("{prefix}.shutdown"));
                    netlist.bind(&suffixed(signal::MACHINE_IDLE), format!("{prefix}.idle"));
                }
            }
        }
        netlist
    }
}

/// Signal ids of the machine-facing side of the bus.
#[derive(Debug, Clone, Copy)]
pub struct MachinePorts {
    position: [SignalId; 3],
    velocity: SignalId,
    all_homed: SignalId,
    program_running: SignalId,
    program_paused: SignalId,
    spindle_on: SignalId,
    machine_on: SignalId,
    manual_lube: SignalId,
    lube_pump: SignalId,
    machine_off: SignalId,
}

impl MachinePorts {
    pub fn declare(bus: &mut SignalBus) -> Result<Self, WiringError> {
        let mut driven = |name: &str, ty: PinType| -> Result<SignalId, WiringError> {
            let id = bus.declare(name, ty, MACHINE_WRITER)?;
            bus.claim_writer(id, MACHINE_WRITER)?;
            Ok(id)
        };
        let position = [
            driven(signal::AXIS_X_POS, PinType::Float)?,
            driven(signal::AXIS_Y_POS, PinType::Float)?,
            driven(signal::AXIS_Z_POS, PinType::Float)?,
        ];
        let velocity = driven(signal::MOTION_VELOCITY, PinType::Float)?;
        let all_homed = driven(signal::ALL_HOMED, PinType::Bit)?;
        let program_running = driven(signal::PROGRAM_RUNNING, PinType::Bit)?;
        let program_paused = driven(signal::PROGRAM_PAUSED, PinType::Bit)?;
        let spindle_on = driven(signal::SPINDLE_ON, PinType::Bit)?;
        let machine_on = driven(signal::MACHINE_IS_ON, PinType::Bit)?;
        let manual_lube = driven(signal::MANUAL_LUBE, PinType::Bit)?;
        Ok(Self {
            position,
            velocity,
            all_homed,
            program_running,
            program_paused,
            spindle_on,
            machine_on,
            manual_lube,
            lube_pump: bus.declare(signal::LUBE_PUMP, PinType::Bit, MACHINE_WRITER)?,
            machine_off: bus.declare(signal::MACHINE_OFF, PinType::Bit, MACHINE_WRITER)?,
        })
    }

    pub fn export(&self, telemetry: &MachineTelemetry, bus: &mut SignalBus) {
        for (id, value) in self.position.iter().zip(telemetry.position) {
            bus.set(*id, PinValue::Float(value));
        }
        bus.set(self.velocity, PinValue::Float(telemetry.velocity));
        bus.set(self.all_homed, PinValue::Bit(telemetry.all_homed));
        bus.set(self.program_running, PinValue::Bit(telemetry.program_running));
        bus.set(self.program_paused, PinValue::Bit(telemetry.program_paused));
        bus.set(self.spindle_on, PinValue::Bit(telemetry.spindle_on));
        bus.set(self.machine_on, PinValue::Bit(telemetry.machine_on));
        bus.set(self.manual_lube, PinValue::Bit(telemetry.manual_lube));
    }

    pub fn pump(&self, bus: &SignalBus) -> bool {
        bus.get(self.lube_pump).is_some_and(|v| v.as_bit())
    }

    pub fn machine_off(&self, bus: &SignalBus) -> bool {
        bus.get(self.machine_off).is_some_and(|v| v.as_bit())
    }
}

#[derive(Debug, Clone, Copy)]
struct Link {
    signal: SignalId,
    pin: PinRef,
}

/// A resolved netlist.
#[derive(Debug, Clone)]
pub struct Wiring {
    bus: SignalBus,
    inputs: Vec<Link>,
    outputs: Vec<Link>,
}

impl Wiring {
    pub fn resolve(
        netlist: &Netlist,
        components: &ComponentSet,
        mut bus: SignalBus,
    ) -> Result<Self, WiringError> {
        let mut inputs: Vec<Link> = Vec::new();
        let mut outputs: Vec<Link> = Vec::new();

        for net in &netlist.nets {
            for pin_name in &net.pins {
                let (pin, spec) = components
                    .find_pin(pin_name)
                    .ok_or_else(|| WiringError::UnknownPin(pin_name.clone()))?;
                if inputs.iter().chain(outputs.iter()).any(|l| l.pin == pin) {
                    return Err(WiringError::PinAlreadyLinked(pin_name.clone()));
                }
                let signal = bus.declare(&net.signal, spec.ty, pin_name)?;
                match spec.dir {
                    PinDir::In => inputs.push(Link { signal, pin }),
                    PinDir::Out => {
                        bus.claim_writer(signal, pin_name)?;
                        outputs.push(Link { signal, pin });
                    }
                }
            }
        }

        debug!(
            signals = bus.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "Netlist resolved"
        );

        Ok(Self {
            bus,
            inputs,
            outputs,
        })
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SignalBus {
        &mut self.bus
    }

    /// Copy signal values onto every linked input pin.
    pub fn drive_inputs(&self, components: &mut ComponentSet) {
        for link in &self.inputs {
            let (Some(value), Some(inst)) =
                (self.bus.get(link.signal), components.get_mut(link.pin.slot))
            else {
                continue;
            };
            // Types were matched during resolve.
            let _ = inst.write_pin(link.pin.pin, value);
        }
    }

    /// Copy every linked output pin onto its signal.
    pub fn collect_outputs(&mut self, components: &ComponentSet) {
        for link in &self.outputs {
            if let Some(value) = components
                .get(link.pin.slot)
                .and_then(|inst| inst.read_pin(link.pin.pin))
            {
                self.bus.set(link.signal, value);
            }
        }
    }
}
