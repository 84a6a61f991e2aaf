use crate::filter::{FilterParams, FilterSpec};
use crate::message::{BusMessage, MessageId, MsgTime};
use crate::stats::StatsState;
use crate::table::{PacketTableDef, Qos, Route};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 16384;
pub const MAX_RESPONSE_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub timestamp: u64,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandType {
    Noop,
    ResetStatus,
    LoadTable { table: PacketTableDef },
    AddPacket { stream_id: MessageId, qos: Qos, buf_lim: u16, filter: FilterSpec },
    RemovePacket { stream_id: MessageId },
    RemoveAllPackets,
    UpdateFilter { stream_id: MessageId, filter: FilterSpec },
    EnableOutput { dest_ip: String },
    SendPacketTableTlm { stream_id: MessageId },
    SetRunLoopDelay { delay_ms: u32 },
    TestFilter { params: FilterParams },
    SendHousekeeping,
}

impl CommandType {
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Noop => "Noop",
            CommandType::ResetStatus => "ResetStatus",
            CommandType::LoadTable { .. } => "LoadTable",
            CommandType::AddPacket { .. } => "AddPacket",
            CommandType::RemovePacket { .. } => "RemovePacket",
            CommandType::RemoveAllPackets => "RemoveAllPackets",
            CommandType::UpdateFilter { .. } => "UpdateFilter",
            CommandType::EnableOutput { .. } => "EnableOutput",
            CommandType::SendPacketTableTlm { .. } => "SendPacketTableTlm",
            CommandType::SetRunLoopDelay { .. } => "SetRunLoopDelay",
            CommandType::TestFilter { .. } => "TestFilter",
            CommandType::SendHousekeeping => "SendHousekeeping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// Rejected before any state changed
    InvalidCommand,
    /// Accepted but only partly carried out (some subscriptions failed, ...)
    PartialFailure,
    ExecutionFailed,
}

/// Housekeeping telemetry, one per housekeeping request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousekeepingTlm {
    pub valid_cmd_cnt: u16,
    pub invalid_cmd_cnt: u16,
    pub run_loop_delay_ms: u32,
    pub last_table_load_ok: bool,
    pub packets_in_table: u16,
    pub stats_state: StatsState,
    pub stats_valid: bool,
    pub pkts_per_sec: u16,
    pub bytes_per_sec: u32,
    pub downlink_enabled: bool,
    pub suppress_send: bool,
    pub tlm_sock_id: u16,
    pub tlm_dest_ip: String,
}

/// Snapshot of one packet table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketTableTlm {
    pub stream_id: MessageId,
    pub in_use: bool,
    pub qos: Qos,
    pub buf_lim: u16,
    pub filter: FilterSpec,
}

impl PacketTableTlm {
    pub fn from_route(route: &Route) -> Self {
        Self {
            stream_id: route.id,
            in_use: true,
            qos: route.qos,
            buf_lim: route.buffer_limit,
            filter: route.filter.into(),
        }
    }

    pub fn unused(stream_id: MessageId) -> Self {
        Self {
            stream_id,
            in_use: false,
            qos: Qos::default(),
            buf_lim: 0,
            filter: FilterSpec { filter_type: 0, params: FilterParams::default() },
        }
    }
}

/// One step of a filter self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTrace {
    pub sequence_count: u16,
    pub time: MsgTime,
    pub seq_cnt_passed: bool,
    pub time_passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message exceeds buffer size")]
    MessageTooLarge,
    #[error("Serialization failed")]
    SerializationError,
}

/// JSON command decoding and telemetry encoding. Published telemetry carries
/// its own sequence counter per message id so ground decimation works on it.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    hk_sequence: u16,
    pkt_tbl_sequence: u16,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_command(&self, json_str: &str) -> Result<Command, ProtocolError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_str(json_str).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)?;
        if json.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(json)
    }

    pub fn create_response(&self, command_id: u32, timestamp: u64, status: ResponseStatus, message: Option<String>) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp,
            status,
            message,
        }
    }

    pub fn encode_housekeeping(&mut self, mid: MessageId, hk: &HousekeepingTlm, time: MsgTime) -> Result<BusMessage, ProtocolError> {
        let seq = self.hk_sequence;
        self.hk_sequence = self.hk_sequence.wrapping_add(1);
        encode(mid, seq, time, hk)
    }

    pub fn encode_packet_table(&mut self, mid: MessageId, tlm: &PacketTableTlm, time: MsgTime) -> Result<BusMessage, ProtocolError> {
        let seq = self.pkt_tbl_sequence;
        self.pkt_tbl_sequence = self.pkt_tbl_sequence.wrapping_add(1);
        encode(mid, seq, time, tlm)
    }
}

fn encode<T: Serialize>(mid: MessageId, seq: u16, time: MsgTime, payload: &T) -> Result<BusMessage, ProtocolError> {
    let body = serde_json::to_vec(payload).map_err(|_| ProtocolError::SerializationError)?;
    BusMessage::telemetry(mid, seq, time, &body).map_err(|_| ProtocolError::MessageTooLarge)
}

/// Decode the JSON payload of a telemetry message published by the gateway.
pub fn decode_payload<'a, T: Deserialize<'a>>(msg: &'a BusMessage) -> Result<T, ProtocolError> {
    serde_json::from_slice(msg.payload()).map_err(|_| ProtocolError::InvalidJson)
}
