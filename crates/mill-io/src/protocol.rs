use mill_core::{IdleTelemetry, MachineSnapshot, OilerTelemetry, ParamAckStatus, PinType, PinValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn is_supported(&self) -> bool {
        self.major == 1
    }
}

#[derive(Debug, Serialize)]
pub struct OilerStateMsg {
    pub instance: String,
    pub phase: &'static str,
    pub pump: bool,
    pub distance: f64,
    pub motion_time_s: f64,
    pub phase_remaining_s: f64,
    pub pump_cycles: u32,
    pub last_cause: Option<&'static str>,
}

impl OilerStateMsg {
    fn new(index: usize, t: &OilerTelemetry) -> Self {
        Self {
            instance: format!("oiler-trigger.{index}"),
            phase: t.phase.as_str(),
            pump: t.pump,
            distance: t.distance,
            motion_time_s: t.motion_time_s,
            phase_remaining_s: t.phase_remaining_s,
            pump_cycles: t.pump_cycles,
            last_cause: t.last_cause.map(|c| c.as_str()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IdleStateMsg {
    pub instance: String,
    pub machine_on: bool,
    pub idle: bool,
    pub shutdown: bool,
    pub idle_elapsed_s: u32,
    pub timeout_s: u32,
    pub shutdown_requests: u32,
}

impl IdleStateMsg {
    fn new(index: usize, t: &IdleTelemetry) -> Self {
        Self {
            instance: format!("idle-shutdown.{index}"),
            machine_on: t.machine_on,
            idle: t.idle,
            shutdown: t.shutdown,
            idle_elapsed_s: t.idle_elapsed_s,
            timeout_s: t.timeout_s,
            shutdown_requests: t.shutdown_requests,
        }
    }
}

/// Outcome of a `set_param` request, echoed with the client's sequence.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParamAckMsg {
    pub sequence: u64,
    pub name: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl ParamAckMsg {
    pub fn from_status(sequence: u64, name: String, status: ParamAckStatus) -> Self {
        match status {
            ParamAckStatus::Applied => Self {
                sequence,
                name,
                status: "applied",
                reason: None,
            },
            _ => Self::rejected(sequence, name, "invalid_value"),
        }
    }

    pub fn rejected(sequence: u64, name: String, reason: &'static str) -> Self {
        Self {
            sequence,
            name,
            status: "rejected",
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StateMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub cycle_count: u64,
    pub unix_us: u64,
    pub cycle_jitter_us: u32,
    pub machine_on: bool,
    pub pump_relay: bool,
    pub machine_off_request: bool,
    pub oilers: Vec<OilerStateMsg>,
    pub idle_timers: Vec<IdleStateMsg>,
    pub param_ack: Option<ParamAckMsg>,
}

impl StateMsg {
    pub fn from_snapshot(
        snapshot: &MachineSnapshot,
        sequence: u64,
        unix_us: u64,
        param_ack: Option<ParamAckMsg>,
    ) -> Self {
        Self {
            msg_type: "state",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            timestamp_us: snapshot.timestamp_us,
            cycle_count: snapshot.cycle_count,
            unix_us,
            cycle_jitter_us: snapshot.cycle_jitter_us,
            machine_on: snapshot.machine_on,
            pump_relay: snapshot.pump_relay,
            machine_off_request: snapshot.machine_off_request,
            oilers: snapshot
                .oilers()
                .iter()
                .enumerate()
                .map(|(i, t)| OilerStateMsg::new(i, t))
                .collect(),
            idle_timers: snapshot
                .idle_timers()
                .iter()
                .enumerate()
                .map(|(i, t)| IdleStateMsg::new(i, t))
                .collect(),
            param_ack,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetParamMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sequence: u64,
    pub name: String,
    pub value: serde_json::Value,
}

/// Operator request to start a lubrication pulse on every oiler wired to
/// `manual-lube`.
#[derive(Debug, Deserialize)]
pub struct ManualLubeMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "ProtocolVersion::v1")]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    SetParam(SetParamMsg),
    ManualLube(ManualLubeMsg),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "set_param" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::SetParam),
            "hello" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Hello),
            "manual_lube" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::ManualLube),
            _ => None,
        }
    }
}

/// Convert a JSON value to a pin value of the parameter's declared type.
pub fn json_to_pin(value: &serde_json::Value, ty: PinType) -> Option<PinValue> {
    match ty {
        PinType::Bit => value.as_bool().map(PinValue::Bit),
        PinType::Float => value.as_f64().map(|v| PinValue::Float(v as f32)),
        PinType::U32 => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(PinValue::U32),
    }
}
