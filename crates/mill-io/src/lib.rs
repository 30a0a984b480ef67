pub mod bridge;
pub mod metrics;
pub mod protocol;

pub use bridge::{run_bridge, BridgeConfig, BridgeError, ParamDesk};
pub use metrics::{init_metrics, serve_metrics, SnapshotRecorder};
pub use protocol::{
    IncomingMessage, ManualLubeMsg, ParamAckMsg, ProtocolVersion, SetParamMsg, StateMsg,
};
