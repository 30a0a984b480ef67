use crate::hal::PinValue;
use crate::idle_shutdown::IdleShutdownTimer;
use crate::instance::{ParamRef, MAX_INSTANCES};
use crate::oiler::{OilerPhase, OilerTrigger, TriggerCause};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, TryLockError};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OilerTelemetry {
    pub phase: OilerPhase,
    pub pump: bool,
    pub distance: f64,
    pub motion_time_s: f64,
    pub phase_remaining_s: f64,
    pub pump_cycles: u32,
    pub last_cause: Option<TriggerCause>,
}

impl OilerTelemetry {
    pub fn capture(oiler: &OilerTrigger, previous: &Self) -> Self {
        let state = oiler.state();
        let outputs = oiler.outputs();
        Self {
            phase: state.phase(),
            pump: outputs.pump,
            distance: state.distance(),
            motion_time_s: state.motion_time().as_secs_f64(),
            phase_remaining_s: state.phase_remaining().as_secs_f64(),
            pump_cycles: oiler.pump_cycles(),
            last_cause: outputs.fired.or(previous.last_cause),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleTelemetry {
    pub machine_on: bool,
    pub idle: bool,
    pub shutdown: bool,
    pub idle_elapsed_s: u32,
    pub timeout_s: u32,
    pub shutdown_requests: u32,
}

impl IdleTelemetry {
    pub fn capture(timer: &IdleShutdownTimer) -> Self {
        let state = timer.state();
        let outputs = timer.outputs();
        Self {
            machine_on: state.machine_on(),
            idle: outputs.idle,
            shutdown: outputs.shutdown,
            idle_elapsed_s: state.idle_elapsed_secs(),
            timeout_s: timer.settings().timeout_s,
            shutdown_requests: timer.shutdown_requests(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParamAckStatus {
    #[default]
    None,
    Applied,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamAck {
    pub sequence: u64,
    pub status: ParamAckStatus,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MachineSnapshot {
    pub timestamp_us: u64,
    pub cycle_count: u64,
    pub cycles_missed: u64,
    pub cycle_jitter_us: u32,
    pub machine_on: bool,
    pub pump_relay: bool,
    pub machine_off_request: bool,
    pub oiler_count: usize,
    pub oilers: [OilerTelemetry; MAX_INSTANCES],
    pub idle_count: usize,
    pub idle_timers: [IdleTelemetry; MAX_INSTANCES],
    pub param_ack: ParamAck,
}

impl MachineSnapshot {
    pub fn oilers(&self) -> &[OilerTelemetry] {
        &self.oilers[..self.oiler_count.min(MAX_INSTANCES)]
    }

    pub fn idle_timers(&self) -> &[IdleTelemetry] {
        &self.idle_timers[..self.idle_count.min(MAX_INSTANCES)]
    }
}

/// Runtime parameter write queued by a diagnostic client.
#[derive(Debug, Clone, Copy)]
pub struct ParamRequest {
    /// Zero means "no request".
    pub sequence: u64,
    pub target: ParamRef,
    pub value: PinValue,
}

impl Default for ParamRequest {
    fn default() -> Self {
        Self {
            sequence: 0,
            target: ParamRef::default(),
            value: PinValue::U32(0),
        }
    }
}

/// Latest-value cell shared between the servo thread and its readers.
///
/// The servo thread only uses the `try_` operations and never waits: a
/// contended publish is skipped and the next cycle carries a newer value.
/// A poisoned lock still holds a whole `T`, so it is read through.
struct LatestValue<T: Copy + Default> {
    value: RwLock<T>,
}

impl<T: Copy + Default> LatestValue<T> {
    fn new() -> Self {
        Self {
            value: RwLock::new(T::default()),
        }
    }

    fn write(&self, value: T) {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = value;
    }

    fn try_write(&self, value: T) -> bool {
        match self.value.try_write() {
            Ok(mut guard) => *guard = value,
            Err(TryLockError::Poisoned(e)) => *e.into_inner() = value,
            Err(TryLockError::WouldBlock) => return false,
        }
        true
    }

    fn read(&self) -> T {
        *self.value.read().unwrap_or_else(|e| e.into_inner())
    }

    fn try_read(&self) -> Option<T> {
        match self.value.try_read() {
            Ok(guard) => Some(*guard),
            Err(TryLockError::Poisoned(e)) => Some(*e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Hand-off between the servo thread and everything else. The servo side
/// never blocks.
pub struct StateExchange {
    snapshot: LatestValue<MachineSnapshot>,
    param_request: LatestValue<ParamRequest>,
    manual_lube: AtomicU64,
}

impl StateExchange {
    pub fn new() -> Self {
        Self {
            snapshot: LatestValue::new(),
            param_request: LatestValue::new(),
            manual_lube: AtomicU64::new(0),
        }
    }

    /// Called by the servo thread every cycle. Returns false when a reader
    /// held the slot and this snapshot was dropped.
    pub fn publish_state(&self, state: MachineSnapshot) -> bool {
        self.snapshot.try_write(state)
    }

    /// Called once by the servo thread on its way out; waits for readers so
    /// the safe-state snapshot is never dropped.
    pub fn publish_final(&self, state: MachineSnapshot) {
        self.snapshot.write(state);
    }

    /// Called by the servo thread; returns the newest request if it has not
    /// been applied yet. A contended slot reads as "nothing new" until the
    /// next cycle.
    pub fn take_param_request(&self, last_applied: u64) -> Option<ParamRequest> {
        let req = self.param_request.try_read()?;
        if req.sequence == 0 || req.sequence <= last_applied {
            None
        } else {
            Some(req)
        }
    }

    /// Called by the bridge thread
    pub fn submit_param_request(&self, req: ParamRequest) {
        self.param_request.write(req);
    }

    /// Called by the bridge thread. Each call becomes one press of the
    /// `manual-lube` signal; presses arriving within one cycle merge.
    pub fn request_manual_lube(&self) -> u64 {
        self.manual_lube.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total manual lube requests so far; the servo thread compares this
    /// against the count it last saw.
    pub fn manual_lube_requests(&self) -> u64 {
        self.manual_lube.load(Ordering::Relaxed)
    }

    /// Called by the bridge and telemetry threads
    pub fn read_state(&self) -> MachineSnapshot {
        self.snapshot.read()
    }
}

impl Default for StateExchange {
    fn default() -> Self {
        Self::new()
    }
}
