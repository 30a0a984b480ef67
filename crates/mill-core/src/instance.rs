use crate::hal::{CyclicComponent, ParamAccess, ParamSpec, PinError, PinSpec, PinType, PinValue};
use crate::idle_shutdown::{IdleParams, IdleShutdownTimer};
use crate::oiler::{OilerParams, OilerTrigger};
use crate::params::{ParamError, Params};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Upper bound on instances per component kind; snapshots are fixed-size.
pub const MAX_INSTANCES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    OilerTrigger,
    IdleShutdown,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OilerTrigger => "oiler-trigger",
            Self::IdleShutdown => "idle-shutdown",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "oiler-trigger" => Some(Self::OilerTrigger),
            "idle-shutdown" => Some(Self::IdleShutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId {
    pub kind: ComponentKind,
    pub index: u8,
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.index)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{kind}: count {count} exceeds the limit of {max}", max = MAX_INSTANCES)]
    TooManyInstances { kind: &'static str, count: usize },
    #[error("{kind} is already loaded")]
    AlreadyLoaded { kind: &'static str },
    #[error("{kind}: {source}")]
    InvalidParams {
        kind: &'static str,
        #[source]
        source: ParamError,
    },
}

pub enum Instance {
    Oiler(OilerTrigger),
    Idle(IdleShutdownTimer),
}

impl CyclicComponent for Instance {
    fn pins(&self) -> &'static [PinSpec] {
        match self {
            Self::Oiler(c) => c.pins(),
            Self::Idle(c) => c.pins(),
        }
    }

    fn params(&self) -> &'static [ParamSpec] {
        match self {
            Self::Oiler(c) => c.params(),
            Self::Idle(c) => c.params(),
        }
    }

    fn read_pin(&self, idx: usize) -> Option<PinValue> {
        match self {
            Self::Oiler(c) => c.read_pin(idx),
            Self::Idle(c) => c.read_pin(idx),
        }
    }

    fn write_pin(&mut self, idx: usize, value: PinValue) -> Result<(), PinError> {
        match self {
            Self::Oiler(c) => c.write_pin(idx, value),
            Self::Idle(c) => c.write_pin(idx, value),
        }
    }

    fn read_param(&self, idx: usize) -> Option<PinValue> {
        match self {
            Self::Oiler(c) => c.read_param(idx),
            Self::Idle(c) => c.read_param(idx),
        }
    }

    fn write_param(&mut self, idx: usize, value: PinValue) -> Result<(), ParamError> {
        match self {
            Self::Oiler(c) => c.write_param(idx, value),
            Self::Idle(c) => c.write_param(idx, value),
        }
    }

    fn update(&mut self, period: Duration) {
        match self {
            Self::Oiler(c) => c.update(period),
            Self::Idle(c) => c.update(period),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Oiler(c) => c.reset(),
            Self::Idle(c) => c.reset(),
        }
    }
}

/// Resolved location of a pin: position in the component set plus pin index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRef {
    pub slot: usize,
    pub pin: usize,
}

/// Resolved location of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamRef {
    pub slot: usize,
    pub param: usize,
}

#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub name: String,
    pub target: ParamRef,
    pub ty: PinType,
    pub access: ParamAccess,
}

/// Every loaded instance, in load order.
#[derive(Default)]
pub struct ComponentSet {
    slots: Vec<(InstanceId, Instance)>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `count` oiler instances sharing the same load-time parameters.
    pub fn load_oilers(&mut self, count: usize, params: OilerParams) -> Result<(), LoadError> {
        let kind = ComponentKind::OilerTrigger;
        self.check_count(kind, count)?;
        let settings = Params::new(params)
            .validate()
            .map_err(|source| LoadError::InvalidParams {
                kind: kind.as_str(),
                source,
            })?;
        for index in 0..count {
            self.push(kind, index, Instance::Oiler(OilerTrigger::new(settings)));
        }
        info!(
            count,
            distance_threshold = params.distance_threshold,
            time_threshold = params.time_threshold,
            pump_duration = params.pump_duration,
            lockout_duration = params.lockout_duration,
            "Loaded oiler-trigger"
        );
        Ok(())
    }

    /// Load `count` idle shutdown timers sharing the same load-time parameters.
    pub fn load_idle_timers(&mut self, count: usize, params: IdleParams) -> Result<(), LoadError> {
        let kind = ComponentKind::IdleShutdown;
        self.check_count(kind, count)?;
        let settings = Params::new(params)
            .validate()
            .map_err(|source| LoadError::InvalidParams {
                kind: kind.as_str(),
                source,
            })?;
        for index in 0..count {
            self.push(kind, index, Instance::Idle(IdleShutdownTimer::new(settings)));
        }
        info!(count, timeout_s = params.timeout_s, "Loaded idle-shutdown");
        Ok(())
    }

    fn check_count(&self, kind: ComponentKind, count: usize) -> Result<(), LoadError> {
        if count > MAX_INSTANCES {
            return Err(LoadError::TooManyInstances {
                kind: kind.as_str(),
                count,
            });
        }
        if self.count(kind) > 0 {
            return Err(LoadError::AlreadyLoaded {
                kind: kind.as_str(),
            });
        }
        Ok(())
    }

    fn push(&mut self, kind: ComponentKind, index: usize, instance: Instance) {
        // check_count bounds index below MAX_INSTANCES.
        let id = InstanceId {
            kind,
            index: index as u8,
        };
        self.slots.push((id, instance));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn count(&self, kind: ComponentKind) -> usize {
        self.slots.iter().filter(|(id, _)| id.kind == kind).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.slots.iter().map(|(id, inst)| (*id, inst))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (InstanceId, &mut Instance)> {
        self.slots.iter_mut().map(|(id, inst)| (*id, inst))
    }

    pub fn get(&self, slot: usize) -> Option<&Instance> {
        self.slots.get(slot).map(|(_, inst)| inst)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Instance> {
        self.slots.get_mut(slot).map(|(_, inst)| inst)
    }

    pub fn id(&self, slot: usize) -> Option<InstanceId> {
        self.slots.get(slot).map(|(id, _)| *id)
    }

    fn find_slot(&self, kind: &str, index: &str) -> Option<usize> {
        let kind = ComponentKind::parse(kind)?;
        let index: u8 = index.parse().ok()?;
        self.slots
            .iter()
            .position(|(id, _)| id.kind == kind && id.index == index)
    }

    /// Resolve `kind.index.name` into its slot and the trailing name.
    fn split_qualified<'a>(&self, qualified: &'a str) -> Option<(usize, &'a str)> {
        let mut parts = qualified.splitn(3, '.');
        let kind = parts.next()?;
        let index = parts.next()?;
        let name = parts.next()?;
        Some((self.find_slot(kind, index)?, name))
    }

    /// Resolve a fully-qualified pin name such as `oiler-trigger.0.pump`.
    pub fn find_pin(&self, qualified: &str) -> Option<(PinRef, PinSpec)> {
        let (slot, name) = self.split_qualified(qualified)?;
        let pins = self.get(slot)?.pins();
        let pin = pins.iter().position(|p| p.name == name)?;
        Some((PinRef { slot, pin }, pins[pin]))
    }

    /// Resolve a fully-qualified parameter name such as `idle-shutdown.0.timeout`.
    pub fn find_param(&self, qualified: &str) -> Option<(ParamRef, ParamSpec)> {
        let (slot, name) = self.split_qualified(qualified)?;
        let params = self.get(slot)?.params();
        let param = params.iter().position(|p| p.name == name)?;
        Some((ParamRef { slot, param }, params[param]))
    }

    /// Name table of every parameter, for diagnostic tools.
    pub fn param_directory(&self) -> Vec<ParamEntry> {
        let mut entries = Vec::new();
        for (slot, (id, inst)) in self.slots.iter().enumerate() {
            for (param, spec) in inst.params().iter().enumerate() {
                entries.push(ParamEntry {
                    name: format!("{id}.{}", spec.name),
                    target: ParamRef { slot, param },
                    ty: spec.ty,
                    access: spec.access,
                });
            }
        }
        entries
    }

    pub fn write_param(&mut self, target: ParamRef, value: PinValue) -> Result<(), ParamError> {
        let inst = self
            .get_mut(target.slot)
            .ok_or(ParamError::NoSuchParam(target.param))?;
        inst.write_param(target.param, value)
    }

    pub fn update_all(&mut self, period: Duration) {
        for (_, inst) in self.slots.iter_mut() {
            inst.update(period);
        }
    }

    pub fn reset_all(&mut self) {
        for (_, inst) in self.slots.iter_mut() {
            inst.reset();
        }
    }
}
