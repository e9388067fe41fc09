//! Wire frame header codec.
//!
//! Every frame starts with a 16 byte big-endian header:
//!
//! | offset | size | field         |
//! |--------|------|---------------|
//! | 0      | 4    | total length  |
//! | 4      | 2    | header length |
//! | 6      | 2    | encoding tag  |
//! | 8      | 4    | operation     |
//! | 12     | 4    | sequence id   |
//!
//! The payload follows as raw bytes.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DanmakuError, Result};

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Sequence id stamped on every frame this client sends.
const CLIENT_SEQUENCE: u32 = 1;

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Heartbeat,
    HeartbeatReply,
    Message,
    Auth,
    AuthReply,
    Unknown(u32),
}

impl Operation {
    pub fn code(self) -> u32 {
        match self {
            Self::Heartbeat => 2,
            Self::HeartbeatReply => 3,
            Self::Message => 5,
            Self::Auth => 7,
            Self::AuthReply => 8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u32> for Operation {
    fn from(code: u32) -> Self {
        match code {
            2 => Self::Heartbeat,
            3 => Self::HeartbeatReply,
            5 => Self::Message,
            7 => Self::Auth,
            8 => Self::AuthReply,
            other => Self::Unknown(other),
        }
    }
}

/// Payload encoding tags (the "protocol version" field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Raw JSON
    Plain,
    /// Raw bytes, used by heartbeat replies and client frames
    PlainAck,
    /// zlib stream wrapping more frames
    Deflate,
    /// brotli stream wrapping more frames
    Brotli,
    Unknown(u16),
}

impl Encoding {
    pub fn tag(self) -> u16 {
        match self {
            Self::Plain => 0,
            Self::PlainAck => 1,
            Self::Deflate => 2,
            Self::Brotli => 3,
            Self::Unknown(tag) => tag,
        }
    }
}

impl From<u16> for Encoding {
    fn from(tag: u16) -> Self {
        match tag {
            0 => Self::Plain,
            1 => Self::PlainAck,
            2 => Self::Deflate,
            3 => Self::Brotli,
            other => Self::Unknown(other),
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_len: u32,
    pub header_len: u16,
    pub encoding: Encoding,
    pub operation: Operation,
    pub sequence: u32,
}

impl FrameHeader {
    /// Parse the header from the first [`HEADER_LEN`] bytes of `data`.
    ///
    /// Fails when fewer than [`HEADER_LEN`] bytes are available or when the
    /// declared total length is smaller than the header itself.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(DanmakuError::protocol(format!(
                "header needs {} bytes, got {}",
                HEADER_LEN,
                data.len()
            )));
        }

        let header = Self {
            total_len: BigEndian::read_u32(&data[0..4]),
            header_len: BigEndian::read_u16(&data[4..6]),
            encoding: Encoding::from(BigEndian::read_u16(&data[6..8])),
            operation: Operation::from(BigEndian::read_u32(&data[8..12])),
            sequence: BigEndian::read_u32(&data[12..16]),
        };

        if (header.total_len as usize) < HEADER_LEN {
            return Err(DanmakuError::protocol(format!(
                "frame length {} is shorter than the header",
                header.total_len
            )));
        }

        Ok(header)
    }

    /// Number of payload bytes following the header.
    pub fn payload_len(&self) -> usize {
        self.total_len as usize - HEADER_LEN
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.total_len);
        buf.put_u16(self.header_len);
        buf.put_u16(self.encoding.tag());
        buf.put_u32(self.operation.code());
        buf.put_u32(self.sequence);
    }
}

/// A single decoded (uncompressed) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub operation: Operation,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(operation: Operation, payload: impl Into<Bytes>) -> Self {
        Self {
            operation,
            payload: payload.into(),
        }
    }
}

/// Build a frame with the given operation and payload, the way the client sends them.
pub fn encode(operation: Operation, payload: &[u8]) -> Bytes {
    encode_with(Encoding::PlainAck, operation, payload)
}

/// Build a frame with an explicit encoding tag. The payload is written as-is.
pub fn encode_with(encoding: Encoding, operation: Operation, payload: &[u8]) -> Bytes {
    let total_len = HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(total_len);
    FrameHeader {
        total_len: total_len as u32,
        header_len: HEADER_LEN as u16,
        encoding,
        operation,
        sequence: CLIENT_SEQUENCE,
    }
    .write_to(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let body = b"test";
        let packet = encode(Operation::Auth, body);

        assert_eq!(BigEndian::read_u32(&packet[0..4]), 20); // 16 + 4
        assert_eq!(BigEndian::read_u16(&packet[4..6]), 16);
        assert_eq!(BigEndian::read_u16(&packet[6..8]), 1);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), 7);
        assert_eq!(BigEndian::read_u32(&packet[12..16]), 1);
        assert_eq!(&packet[16..], body);
    }

    #[test]
    fn test_empty_heartbeat() {
        let packet = encode(Operation::Heartbeat, &[]);
        assert_eq!(packet.len(), HEADER_LEN);

        let header = FrameHeader::parse(&packet).unwrap();
        assert_eq!(header.operation, Operation::Heartbeat);
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn test_parse_rejects_short_length() {
        let mut packet = encode(Operation::Message, b"{}").to_vec();
        packet[0..4].copy_from_slice(&3u32.to_be_bytes());

        let err = FrameHeader::parse(&packet).unwrap_err();
        assert!(matches!(err, DanmakuError::Protocol(_)));
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        assert!(FrameHeader::parse(&[0, 0, 0, 16]).is_err());
    }

    #[test]
    fn test_unknown_codes_round_trip() {
        assert_eq!(Operation::from(42), Operation::Unknown(42));
        assert_eq!(Operation::Unknown(42).code(), 42);
        assert_eq!(Encoding::from(9).tag(), 9);
    }
}
