pub mod control_loop;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod idle_shutdown;
pub mod instance;
pub mod oiler;
pub mod params;
pub mod sync;
pub mod tags;
pub mod timebase;
pub mod wiring;

mod component_proptest;

pub use control_loop::{ExecutionStats, ServoConfig, ServoFault, ServoThread};
pub use hal::{CyclicComponent, MachineIO, MachineTelemetry, PinType, PinValue};
#[cfg(feature = "simulation")]
pub use hal_sim::{SimProfile, SimulatedMill};
pub use idle_shutdown::{IdleParams, IdleShutdownTimer};
pub use instance::{ComponentKind, ComponentSet, InstanceId, LoadError, ParamEntry, ParamRef};
pub use oiler::{OilerParams, OilerPhase, OilerTrigger, TriggerCause};
pub use params::{ParamError, Params, Unvalidated, Validated};
pub use sync::{
    IdleTelemetry, MachineSnapshot, OilerTelemetry, ParamAck, ParamAckStatus, ParamRequest,
    StateExchange,
};
pub use timebase::TimeBase;
pub use wiring::{Netlist, WiringError};
