use crate::metrics::{BRIDGE_CONNECTED, PARAM_WRITES};
use crate::protocol::{
    json_to_pin, HelloMsg, IncomingMessage, ParamAckMsg, ProtocolVersion, SetParamMsg, StateMsg,
};
use mill_core::hal::ParamAccess;
use mill_core::{ParamAck, ParamEntry, ParamRequest, StateExchange, TimeBase};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    pub require_handshake: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7100".to_string(),
            publish_interval: Duration::from_millis(100),
            require_handshake: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bridge socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct InboundState {
    last_sequence: Option<u64>,
    handshake_seen: bool,
    client_id: Option<String>,
}

impl InboundState {
    fn new() -> Self {
        Self {
            last_sequence: None,
            handshake_seen: false,
            client_id: None,
        }
    }

    fn reset(&mut self) {
        self.last_sequence = None;
        self.handshake_seen = false;
        self.client_id = None;
    }

    fn accept_sequence(&mut self, sequence: u64) -> bool {
        if sequence == 0 {
            warn!("set_param sequence missing or zero");
            return false;
        }
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                warn!(sequence, last_sequence = last, "Out-of-order set_param sequence");
                return false;
            }
        }
        self.last_sequence = Some(sequence);
        true
    }

    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.client_id = hello.client_id.clone();
    }
}

/// Longest inbound line accepted before the client is dropped.
const MAX_LINE_BYTES: usize = 4096;

/// Splits the inbound byte stream into newline-terminated lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
struct LineTooLong(usize);

impl LineBuffer {
    /// Append received bytes and return every complete line. Fails once the
    /// unterminated tail grows past `MAX_LINE_BYTES`.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            match std::str::from_utf8(&line) {
                Ok(text) if !text.trim().is_empty() => lines.push(text.trim().to_string()),
                Ok(_) => {}
                Err(_) => debug!("Ignoring non-UTF-8 line"),
            }
        }
        if self.buf.len() > MAX_LINE_BYTES {
            return Err(LineTooLong(self.buf.len()));
        }
        Ok(lines)
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug)]
struct InFlight {
    request: u64,
    client_sequence: u64,
    name: String,
}

/// Turns client `set_param` messages into servo requests and servo
/// acknowledgements back into client-facing acks.
///
/// Request sequence numbers are assigned here and keep increasing across
/// client connections.
pub struct ParamDesk {
    directory: HashMap<String, ParamEntry>,
    next_request: u64,
    in_flight: VecDeque<InFlight>,
    last_ack: Option<ParamAckMsg>,
}

impl ParamDesk {
    pub fn new(entries: Vec<ParamEntry>) -> Self {
        Self {
            directory: entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
            next_request: 1,
            in_flight: VecDeque::new(),
            last_ack: None,
        }
    }

    /// Validate a request against the parameter directory and queue it for
    /// the servo thread. Refusals become the latest ack immediately.
    pub fn submit(&mut self, msg: &SetParamMsg, exchange: &StateExchange) -> bool {
        let refusal = match self.directory.get(&msg.name) {
            None => Some("unknown_param"),
            Some(entry) if entry.access == ParamAccess::ReadOnly => Some("read_only"),
            Some(entry) => match json_to_pin(&msg.value, entry.ty) {
                None => Some("type_mismatch"),
                Some(value) => {
                    let request = self.next_request;
                    self.next_request += 1;
                    exchange.submit_param_request(ParamRequest {
                        sequence: request,
                        target: entry.target,
                        value,
                    });
                    self.in_flight.push_back(InFlight {
                        request,
                        client_sequence: msg.sequence,
                        name: msg.name.clone(),
                    });
                    None
                }
            },
        };
        match refusal {
            Some(reason) => {
                self.refuse(msg.sequence, &msg.name, reason);
                false
            }
            None => true,
        }
    }

    pub fn refuse(&mut self, sequence: u64, name: &str, reason: &'static str) {
        warn!(sequence, name, reason, "set_param refused");
        PARAM_WRITES.with_label_values(&["refused"]).inc();
        self.last_ack = Some(ParamAckMsg::rejected(sequence, name.to_string(), reason));
    }

    /// Match the servo's latest acknowledgement against pending requests.
    pub fn settle(&mut self, ack: ParamAck) {
        while let Some(front) = self.in_flight.front() {
            if front.request > ack.sequence {
                break;
            }
            let Some(entry) = self.in_flight.pop_front() else {
                break;
            };
            let msg = if entry.request == ack.sequence {
                ParamAckMsg::from_status(entry.client_sequence, entry.name, ack.status)
            } else {
                // Overwritten in the exchange before the servo saw it.
                ParamAckMsg::rejected(entry.client_sequence, entry.name, "superseded")
            };
            PARAM_WRITES.with_label_values(&[msg.status]).inc();
            debug!(sequence = msg.sequence, name = %msg.name, status = msg.status, "set_param settled");
            self.last_ack = Some(msg);
        }
    }

    pub fn last_ack(&self) -> Option<&ParamAckMsg> {
        self.last_ack.as_ref()
    }
}

pub fn run_bridge(
    exchange: Arc<StateExchange>,
    timebase: TimeBase,
    config: BridgeConfig,
    directory: Vec<ParamEntry>,
    stop: Arc<AtomicBool>,
) -> Result<(), BridgeError> {
    let listener = TcpListener::bind(&config.bind_addr).map_err(|source| BridgeError::Bind {
        addr: config.bind_addr.clone(),
        source,
    })?;
    listener.set_nonblocking(true)?;

    info!(addr = %config.bind_addr, "Bridge listening");

    let mut desk = ParamDesk::new(directory);
    let mut client: Option<TcpStream> = None;
    let mut recv_buf = LineBuffer::default();
    let mut send_buf: Vec<u8> = Vec::new();
    let mut send_offset: usize = 0;
    let mut last_publish = Instant::now();
    let mut state_sequence: u64 = 0;
    let mut inbound_state = InboundState::new();

    loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        if client.is_none() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    info!(client_addr = %addr, "Bridge client connected");
                    match stream.set_nonblocking(true) {
                        Ok(()) => {
                            client = Some(stream);
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(err) => warn!(error = %err, "Failed to set client nonblocking"),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!("Bridge accept error: {}", err);
                }
            }
        }

        let mut drop_client = false;
        if let Some(stream) = client.as_mut() {
            // Receive data
            let mut temp = [0u8; 1024];
            match stream.read(&mut temp) {
                Ok(0) => {
                    info!("Bridge client disconnected");
                    drop_client = true;
                }
                Ok(n) => match recv_buf.push(&temp[..n]) {
                    Ok(lines) => {
                        for line in lines {
                            match IncomingMessage::parse(&line) {
                                Some(msg) => handle_incoming(
                                    msg,
                                    &exchange,
                                    &mut desk,
                                    config.require_handshake,
                                    &mut inbound_state,
                                ),
                                None => debug!(line = %line, "Ignoring unrecognised message"),
                            }
                        }
                    }
                    Err(LineTooLong(len)) => {
                        warn!(len, max = MAX_LINE_BYTES, "Inbound line too long, dropping client");
                        drop_client = true;
                    }
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(error = %err, "Bridge read error");
                    drop_client = true;
                }
            }

            // Publish state
            if send_buf.is_empty() && last_publish.elapsed() >= config.publish_interval {
                state_sequence = state_sequence.wrapping_add(1);
                let snapshot = exchange.read_state();
                desk.settle(snapshot.param_ack);
                let msg = StateMsg::from_snapshot(
                    &snapshot,
                    state_sequence,
                    timebase.unix_us(),
                    desk.last_ack().cloned(),
                );
                if let Ok(line) = serde_json::to_string(&msg) {
                    send_buf = line.into_bytes();
                    send_buf.push(b'\n');
                    send_offset = 0;
                }
                last_publish = Instant::now();
            }

            if !send_buf.is_empty() {
                match stream.write(&send_buf[send_offset..]) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        send_offset += n;
                        if send_offset >= send_buf.len() {
                            send_buf.clear();
                            send_offset = 0;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge write error");
                        drop_client = true;
                    }
                }
            }
        }

        if drop_client {
            client = None;
            recv_buf.clear();
            send_buf.clear();
            send_offset = 0;
            inbound_state.reset();
            BRIDGE_CONNECTED.set(0.0);
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    info!("Bridge stopped");
    Ok(())
}

#[instrument(skip(msg, exchange, desk, inbound_state), fields(client_id = ?inbound_state.client_id))]
fn handle_incoming(
    msg: IncomingMessage,
    exchange: &StateExchange,
    desk: &mut ParamDesk,
    require_handshake: bool,
    inbound_state: &mut InboundState,
) {
    match msg {
        IncomingMessage::Hello(hello) => {
            if !hello.protocol_version.is_supported() {
                warn!(
                    major = hello.protocol_version.major,
                    minor = hello.protocol_version.minor,
                    "Unsupported protocol version"
                );
                return;
            }
            inbound_state.note_handshake(&hello);
            info!(
                client_id = ?hello.client_id,
                capabilities = ?hello.capabilities,
                "Bridge handshake received"
            );
        }
        IncomingMessage::SetParam(req) => {
            if let Err(reason) = admit(
                inbound_state,
                require_handshake,
                req.protocol_version,
                req.sequence,
            ) {
                desk.refuse(req.sequence, &req.name, reason);
                return;
            }
            if desk.submit(&req, exchange) {
                debug!(
                    sequence = req.sequence,
                    name = %req.name,
                    value = %req.value,
                    "set_param queued"
                );
            }
        }
        IncomingMessage::ManualLube(req) => {
            if let Err(reason) = admit(
                inbound_state,
                require_handshake,
                req.protocol_version,
                req.sequence,
            ) {
                desk.refuse(req.sequence, MANUAL_LUBE, reason);
                return;
            }
            let presses = exchange.request_manual_lube();
            info!(sequence = req.sequence, presses, "Manual lubrication requested");
        }
    }
}

const MANUAL_LUBE: &str = "manual_lube";

/// Checks shared by every client request that changes machine state.
fn admit(
    inbound_state: &mut InboundState,
    require_handshake: bool,
    version: ProtocolVersion,
    sequence: u64,
) -> Result<(), &'static str> {
    if !version.is_supported() {
        return Err("unsupported_version");
    }
    if require_handshake && !inbound_state.handshake_seen {
        return Err("handshake_required");
    }
    if !inbound_state.accept_sequence(sequence) {
        return Err("out_of_order");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_core::{ComponentSet, IdleParams, OilerParams, ParamAckStatus, PinValue};
    use serde_json::json;

    fn desk() -> ParamDesk {
        let mut set = ComponentSet::new();
        set.load_oilers(1, OilerParams::default()).unwrap();
        set.load_idle_timers(1, IdleParams::default()).unwrap();
        ParamDesk::new(set.param_directory())
    }

    fn set_param(sequence: u64, name: &str, value: serde_json::Value) -> SetParamMsg {
        let raw = json!({"type": "set_param", "sequence": sequence, "name": name, "value": value});
        match IncomingMessage::parse(&raw.to_string()) {
            Some(IncomingMessage::SetParam(msg)) => msg,
            other => panic!("expected set_param, got {other:?}"),
        }
    }

    #[test]
    fn refuses_unknown_read_only_and_mistyped_params() {
        let exchange = StateExchange::new();
        let mut desk = desk();

        assert!(!desk.submit(&set_param(1, "idle-shutdown.3.timeout", json!(5)), &exchange));
        assert_eq!(desk.last_ack().and_then(|a| a.reason), Some("unknown_param"));

        assert!(!desk.submit(
            &set_param(2, "oiler-trigger.0.pump-duration", json!(1.0)),
            &exchange
        ));
        assert_eq!(desk.last_ack().and_then(|a| a.reason), Some("read_only"));

        assert!(!desk.submit(&set_param(3, "idle-shutdown.0.timeout", json!("soon")), &exchange));
        assert_eq!(desk.last_ack().and_then(|a| a.reason), Some("type_mismatch"));

        assert!(exchange.take_param_request(0).is_none());
    }

    #[test]
    fn forwards_and_settles_with_client_sequence() {
        let exchange = StateExchange::new();
        let mut desk = desk();

        assert!(desk.submit(&set_param(41, "idle-shutdown.0.timeout", json!(600)), &exchange));
        let req = exchange.take_param_request(0).unwrap();
        assert_eq!(req.sequence, 1);
        assert_eq!(req.value, PinValue::U32(600));

        desk.settle(ParamAck {
            sequence: 1,
            status: ParamAckStatus::Applied,
        });
        let ack = desk.last_ack().unwrap();
        assert_eq!(ack.sequence, 41);
        assert_eq!(ack.status, "applied");
    }

    #[test]
    fn overwritten_requests_are_reported_superseded() {
        let exchange = StateExchange::new();
        let mut desk = desk();
        desk.submit(&set_param(1, "idle-shutdown.0.timeout", json!(60)), &exchange);
        desk.submit(&set_param(2, "idle-shutdown.0.timeout", json!(0)), &exchange);

        desk.settle(ParamAck {
            sequence: 2,
            status: ParamAckStatus::Rejected,
        });
        let ack = desk.last_ack().unwrap();
        assert_eq!(ack.sequence, 2);
        assert_eq!(ack.reason, Some("invalid_value"));
        assert!(desk.in_flight.is_empty());
    }

    #[test]
    fn sequence_must_increase() {
        let mut inbound = InboundState::new();
        assert!(!inbound.accept_sequence(0));
        assert!(inbound.accept_sequence(5));
        assert!(!inbound.accept_sequence(5));
        assert!(inbound.accept_sequence(6));
        inbound.reset();
        assert!(inbound.accept_sequence(1));
    }

    #[test]
    fn splits_lines_across_reads() {
        let mut lines = LineBuffer::default();
        assert_eq!(lines.push(b"{\"type\":").unwrap(), Vec::<String>::new());
        assert_eq!(
            lines.push(b"\"hello\"}\n\n{\"a\":1}\n{").unwrap(),
            vec![r#"{"type":"hello"}"#.to_string(), r#"{"a":1}"#.to_string()]
        );
    }

    #[test]
    fn unterminated_input_is_capped() {
        let mut lines = LineBuffer::default();
        let chunk = [b'x'; 1024];
        for _ in 0..MAX_LINE_BYTES / chunk.len() {
            assert!(lines.push(&chunk).is_ok());
        }
        assert_eq!(lines.push(b"x"), Err(LineTooLong(MAX_LINE_BYTES + 1)));
        lines.clear();
        assert_eq!(lines.push(b"{}\n").unwrap(), vec!["{}".to_string()]);
    }

    #[test]
    fn manual_lube_shares_request_checks() {
        let exchange = StateExchange::new();
        let mut desk = desk();
        let mut inbound = InboundState::new();
        let lube = |sequence: u64| {
            let raw = json!({"type": "manual_lube", "sequence": sequence});
            IncomingMessage::parse(&raw.to_string()).unwrap()
        };

        handle_incoming(lube(1), &exchange, &mut desk, true, &mut inbound);
        assert_eq!(desk.last_ack().and_then(|a| a.reason), Some("handshake_required"));
        assert_eq!(exchange.manual_lube_requests(), 0);

        handle_incoming(lube(1), &exchange, &mut desk, false, &mut inbound);
        assert_eq!(exchange.manual_lube_requests(), 1);

        handle_incoming(lube(1), &exchange, &mut desk, false, &mut inbound);
        let ack = desk.last_ack().unwrap();
        assert_eq!((ack.name.as_str(), ack.reason), ("manual_lube", Some("out_of_order")));
        assert_eq!(exchange.manual_lube_requests(), 1);
    }
}
