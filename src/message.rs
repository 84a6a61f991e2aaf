//! Software bus message framing.
//!
//! Messages use a CCSDS-style layout: a 6 byte primary header followed, for
//! telemetry, by a 6 byte time secondary header. All fields are big-endian.
//!
//! ```text
//! 0      2      4      6          10     12
//! +------+------+------+----------+------+---------
//! | sid  | seq  | len  | seconds  | sub  | payload
//! +------+------+------+----------+------+---------
//! ```
//!
//! `sid` is the full message identifier, `seq` carries two sequence flag bits
//! and a 14 bit sequence count, `len` is the total length minus seven.

use crate::error::PacketError;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub const PRIMARY_HEADER_SIZE: usize = 6;
pub const TLM_SECONDARY_HEADER_SIZE: usize = 6;
pub const TLM_HEADER_SIZE: usize = 12;
pub const MAX_MESSAGE_SIZE: usize = 32768;

const_assert_eq!(TLM_HEADER_SIZE, PRIMARY_HEADER_SIZE + TLM_SECONDARY_HEADER_SIZE);

const SEQUENCE_COUNT_MASK: u16 = 0x3FFF;
const SEQUENCE_FLAGS_UNSEGMENTED: u16 = 0xC000;

/// Full software bus message identifier (stream id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u16);

impl MessageId {
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for MessageId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Telemetry time stamp carried in the secondary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgTime {
    pub seconds: u32,
    pub subseconds: u16,
}

impl MsgTime {
    pub const fn new(seconds: u32, subseconds: u16) -> Self {
        Self { seconds, subseconds }
    }

    /// Wall clock time, subseconds in units of 2^-16 s.
    pub fn now() -> Self {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let subseconds = (u64::from(since_epoch.subsec_micros()) << 16) / 1_000_000;
        Self::new(since_epoch.as_secs() as u32, subseconds as u16)
    }
}

/// A complete message as it travels on the software bus. The bytes are
/// forwarded to the ground verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBusMessage")]
pub struct BusMessage {
    #[serde(with = "serde_bytes")]
    bytes: alloc::vec::Vec<u8>,
}

/// Unchecked wire form, validated through [`BusMessage::from_bytes`].
#[derive(Deserialize)]
struct RawBusMessage {
    #[serde(with = "serde_bytes")]
    bytes: alloc::vec::Vec<u8>,
}

impl TryFrom<RawBusMessage> for BusMessage {
    type Error = PacketError;

    fn try_from(raw: RawBusMessage) -> Result<Self, Self::Error> {
        Self::from_bytes(raw.bytes)
    }
}

impl BusMessage {
    /// Wrap raw bytes received from the bus, checking the primary header is present.
    pub fn from_bytes(bytes: alloc::vec::Vec<u8>) -> Result<Self, PacketError> {
        if bytes.len() < PRIMARY_HEADER_SIZE {
            return Err(PacketError::TooShort {
                len: bytes.len(),
                min: PRIMARY_HEADER_SIZE,
            });
        }
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(PacketError::TooLarge {
                len: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self { bytes })
    }

    /// Build a telemetry message with both headers populated.
    pub fn telemetry(
        msg_id: MessageId,
        sequence_count: u16,
        time: MsgTime,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        let total = TLM_HEADER_SIZE + payload.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(PacketError::TooLarge {
                len: total,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut bytes = alloc::vec::Vec::with_capacity(total);
        bytes.extend_from_slice(&msg_id.0.to_be_bytes());
        bytes.extend_from_slice(&(SEQUENCE_FLAGS_UNSEGMENTED | (sequence_count & SEQUENCE_COUNT_MASK)).to_be_bytes());
        bytes.extend_from_slice(&((total - 7) as u16).to_be_bytes());
        bytes.extend_from_slice(&time.seconds.to_be_bytes());
        bytes.extend_from_slice(&time.subseconds.to_be_bytes());
        bytes.extend_from_slice(payload);

        Ok(Self { bytes })
    }

    pub fn msg_id(&self) -> MessageId {
        MessageId(u16::from_be_bytes([self.bytes[0], self.bytes[1]]))
    }

    pub fn sequence_count(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]]) & SEQUENCE_COUNT_MASK
    }

    pub fn set_sequence_count(&mut self, sequence_count: u16) {
        let flags = u16::from_be_bytes([self.bytes[2], self.bytes[3]]) & !SEQUENCE_COUNT_MASK;
        let word = flags | (sequence_count & SEQUENCE_COUNT_MASK);
        self.bytes[2..4].copy_from_slice(&word.to_be_bytes());
    }

    /// Secondary header time, if the message is long enough to carry one.
    pub fn time(&self) -> Option<MsgTime> {
        if self.bytes.len() < TLM_HEADER_SIZE {
            return None;
        }
        let b = &self.bytes;
        Some(MsgTime {
            seconds: u32::from_be_bytes([b[6], b[7], b[8], b[9]]),
            subseconds: u16::from_be_bytes([b[10], b[11]]),
        })
    }

    /// Overwrites the secondary header time. Returns false when the message
    /// has no secondary header.
    pub fn set_time(&mut self, time: MsgTime) -> bool {
        if self.bytes.len() < TLM_HEADER_SIZE {
            return false;
        }
        self.bytes[6..10].copy_from_slice(&time.seconds.to_be_bytes());
        self.bytes[10..12].copy_from_slice(&time.subseconds.to_be_bytes());
        true
    }

    pub fn payload(&self) -> &[u8] {
        let start = TLM_HEADER_SIZE.min(self.bytes.len());
        &self.bytes[start..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_header_fields() {
        let msg = BusMessage::telemetry(MessageId(0x0883), 0x1234, MsgTime::new(1000, 0x8000), b"abc").unwrap();

        assert_eq!(msg.msg_id(), MessageId(0x0883));
        assert_eq!(msg.sequence_count(), 0x1234);
        assert_eq!(msg.time(), Some(MsgTime::new(1000, 0x8000)));
        assert_eq!(msg.payload(), b"abc");
        assert_eq!(msg.len(), TLM_HEADER_SIZE + 3);

        // Length field is total length minus seven
        assert_eq!(u16::from_be_bytes([msg.as_bytes()[4], msg.as_bytes()[5]]), 8);
    }

    #[test]
    fn test_sequence_count_wraps_to_14_bits() {
        let mut msg = BusMessage::telemetry(MessageId(0x10), 0, MsgTime::default(), &[]).unwrap();
        msg.set_sequence_count(0x4005);
        assert_eq!(msg.sequence_count(), 0x0005);
        // Sequence flags survive the update
        assert_eq!(msg.as_bytes()[2] & 0xC0, 0xC0);
    }

    #[test]
    fn test_short_message_has_no_time() {
        let msg = BusMessage::from_bytes(vec![0x08, 0x01, 0xC0, 0x00, 0x00, 0x00]).unwrap();
        assert!(msg.time().is_none());
        assert!(msg.payload().is_empty());

        assert!(matches!(
            BusMessage::from_bytes(vec![0x08, 0x01]),
            Err(PacketError::TooShort { len: 2, .. })
        ));
    }

    #[test]
    fn test_deserialize_checks_header_length() {
        assert!(serde_json::from_str::<BusMessage>(r#"{"bytes":[8,1]}"#).is_err());

        let msg: BusMessage = serde_json::from_str(r#"{"bytes":[8,1,192,0,0,0]}"#).unwrap();
        assert_eq!(msg.msg_id(), MessageId(0x0801));
    }
}
