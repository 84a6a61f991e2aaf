//! Error taxonomy for the gateway.
//!
//! Configuration errors are rejected before any state changes. Bus and socket
//! errors are isolated to the route or packet that raised them and are
//! reported upward without aborting the surrounding operation.

use crate::message::MessageId;
use crate::protocol::ProtocolError;
use thiserror::Error;

/// Malformed bus message framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("message is {len} bytes, shorter than the {min} byte header")]
    TooShort { len: usize, min: usize },

    #[error("payload of {len} bytes exceeds maximum message size {max}")]
    TooLarge { len: usize, max: usize },
}

/// Failures reported by the software bus collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("message id {0} is outside the bus identifier space")]
    InvalidMsgId(MessageId),

    #[error("message id {0} is not subscribed on this pipe")]
    NotSubscribed(MessageId),

    #[error("subscription table full ({max} entries)")]
    SubscriptionsFull { max: usize },

    #[error("subscription to {0} rejected by the bus")]
    SubscribeRejected(MessageId),

    #[error("unsubscribe from {0} rejected by the bus")]
    UnsubscribeRejected(MessageId),

    #[error("telemetry serialization failed: {0}")]
    Serialization(String),
}

/// Packet table command failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("message id {0} cannot be mapped to a packet table slot")]
    InvalidMessageId(MessageId),

    #[error("packet {0} already exists in the packet table")]
    AlreadyExists(MessageId),

    #[error("packet {0} is not defined in the packet table")]
    NotInTable(MessageId),

    #[error("invalid filter type {0}")]
    InvalidFilterType(u16),

    #[error("packets {first} and {second} both map to slot {slot}")]
    SlotConflict {
        slot: usize,
        first: MessageId,
        second: MessageId,
    },

    #[error("software bus subscription for {id} failed: {source}")]
    SubscribeFailed { id: MessageId, source: BusError },

    #[error("removed {id} from the packet table, but unsubscribe failed: {source}")]
    UnsubscribeFailed { id: MessageId, source: BusError },

    #[error("loaded table with {packets} packets, {failed} subscriptions failed")]
    PartialLoad { packets: usize, failed: usize },

    #[error("removed {packets} packets, {failed} unsubscribes failed")]
    PartialRemove { packets: usize, failed: usize },
}

/// Telemetry output (destination socket) failures.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid destination IP address '{0}'")]
    InvalidAddress(String),

    #[error("telemetry output socket open failed: {0}")]
    SocketOpen(#[source] std::io::Error),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top level error returned by application commands.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid run loop delay {requested} ms, valid inclusive range [{min},{max}] ms")]
    InvalidRunLoopDelay { requested: u32, min: u32, max: u32 },

    #[error("command queue full")]
    CommandQueueFull,
}
