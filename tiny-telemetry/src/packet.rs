//! Wire-format definitions for telemetry datagrams.
//!
//! Every datagram a sensor sends is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (fixed header, float32 readings).
//! - Serialising a packet into a byte buffer ready for transmission.
//! - Deserialising the header and the reading payload separately, so the
//!   server can still account for a packet whose payload is truncated.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte fields are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Device ID           |    Sequence Number (hi)       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Sequence Number (lo)       |        Timestamp (hi)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Timestamp (lo)         |   Msg Type    |  Batch Count  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Reading 0 (IEEE-754 float32) ...                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes.
//! device_id(2) + seq(4) + timestamp(4) + msg_type(1) + batch_count(1)
//!
//! There is no checksum: the protocol trusts the transport.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

/// Byte length of one encoded reading.
pub const READING_LEN: usize = 4;

// Byte offsets of each field within the serialised header.
const OFF_DEVICE_ID: usize = 0;
const OFF_SEQ: usize = 2;
const OFF_TIMESTAMP: usize = 6;
const OFF_MSG_TYPE: usize = 10;
const OFF_BATCH_COUNT: usize = 11;

/// Packet kind carried in the `msg_type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Sensor readings; advances the device's sequence counter.
    Data,
    /// Liveness signal; carries no readings and does not advance seq.
    Heartbeat,
    /// Any other byte value.  Decoded so it can be logged, never acted upon.
    Unknown(u8),
}

impl MsgType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MsgType::Data,
            2 => MsgType::Heartbeat,
            v => MsgType::Unknown(v),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MsgType::Data => 1,
            MsgType::Heartbeat => 2,
            MsgType::Unknown(v) => v,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgType::Data => write!(f, "DATA"),
            MsgType::Heartbeat => write!(f, "HB"),
            MsgType::Unknown(v) => write!(f, "TYPE{v}"),
        }
    }
}

/// Fixed-size protocol header, fields in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub device_id: u16,
    /// Sequence number of the device's DATA stream.
    pub seq: u32,
    /// Sender clock, seconds since the Unix epoch (truncated to 32 bits).
    pub timestamp: u32,
    pub msg_type: MsgType,
    /// Number of float32 readings that follow the header.
    pub batch_count: u8,
}

impl Header {
    /// Byte length the payload must have for this header.
    pub fn payload_len(&self) -> usize {
        self.batch_count as usize * READING_LEN
    }
}

/// A complete telemetry datagram: header + readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub readings: Vec<f32>,
}

/// Errors that can arise when parsing a raw datagram (the FormatError kind).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("packet too short for header: {len} < {HEADER_LEN} bytes")]
    HeaderTooShort { len: usize },
    /// Fewer payload bytes than `batch_count × 4`.
    #[error("not enough bytes for readings: need {needed}, have {available}")]
    PayloadTooShort { needed: usize, available: usize },
}

impl Packet {
    /// Build a packet stamped with the current wall-clock second.
    pub fn new(device_id: u16, seq: u32, msg_type: MsgType, readings: Vec<f32>) -> Self {
        Self::with_timestamp(device_id, seq, unix_seconds() as u32, msg_type, readings)
    }

    /// Build a packet with an explicit sender timestamp.
    ///
    /// A HEARTBEAT never carries readings; any supplied are discarded.
    /// `batch_count` is the reading count masked to 8 bits.
    pub fn with_timestamp(
        device_id: u16,
        seq: u32,
        timestamp: u32,
        msg_type: MsgType,
        mut readings: Vec<f32>,
    ) -> Self {
        if msg_type == MsgType::Heartbeat {
            readings.clear();
        }
        Self {
            header: Header {
                device_id,
                seq,
                timestamp,
                msg_type,
                batch_count: (readings.len() & 0xFF) as u8,
            },
            readings,
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// Every reading is written, even when more than 255 were supplied and
    /// `batch_count` wrapped; the receiver reads only `batch_count` of them.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.readings.len() * READING_LEN];
        let h = &self.header;

        buf[OFF_DEVICE_ID..OFF_DEVICE_ID + 2].copy_from_slice(&h.device_id.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq.to_be_bytes());
        buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 4].copy_from_slice(&h.timestamp.to_be_bytes());
        buf[OFF_MSG_TYPE] = h.msg_type.to_u8();
        buf[OFF_BATCH_COUNT] = h.batch_count;

        for (chunk, reading) in buf[HEADER_LEN..]
            .chunks_exact_mut(READING_LEN)
            .zip(&self.readings)
        {
            chunk.copy_from_slice(&reading.to_be_bytes());
        }
        buf
    }

    /// Parse a complete packet, failing if either the header or the
    /// payload is truncated.  Bytes beyond `batch_count` readings are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = decode_header(buf)?;
        let readings = decode_readings(&buf[HEADER_LEN..], header.batch_count as usize)?;
        Ok(Self { header, readings })
    }
}

/// Encode a packet stamped with the current time.
pub fn encode(device_id: u16, seq: u32, msg_type: MsgType, readings: &[f32]) -> Vec<u8> {
    Packet::new(device_id, seq, msg_type, readings.to_vec()).encode()
}

/// Parse the fixed 12-byte header from the front of `buf`.
pub fn decode_header(buf: &[u8]) -> Result<Header, PacketError> {
    let Some(raw) = buf.get(..HEADER_LEN) else {
        return Err(PacketError::HeaderTooShort { len: buf.len() });
    };

    Ok(Header {
        device_id: u16::from_be_bytes([raw[OFF_DEVICE_ID], raw[OFF_DEVICE_ID + 1]]),
        seq: u32::from_be_bytes([
            raw[OFF_SEQ],
            raw[OFF_SEQ + 1],
            raw[OFF_SEQ + 2],
            raw[OFF_SEQ + 3],
        ]),
        timestamp: u32::from_be_bytes([
            raw[OFF_TIMESTAMP],
            raw[OFF_TIMESTAMP + 1],
            raw[OFF_TIMESTAMP + 2],
            raw[OFF_TIMESTAMP + 3],
        ]),
        msg_type: MsgType::from_u8(raw[OFF_MSG_TYPE]),
        batch_count: raw[OFF_BATCH_COUNT],
    })
}

/// Parse `count` big-endian float32 readings from the front of `payload`.
pub fn decode_readings(payload: &[u8], count: usize) -> Result<Vec<f32>, PacketError> {
    let needed = count * READING_LEN;
    let Some(raw) = payload.get(..needed) else {
        return Err(PacketError::PayloadTooShort {
            needed,
            available: payload.len(),
        });
    };

    Ok(raw
        .chunks_exact(READING_LEN)
        .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Whole seconds since the Unix epoch.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
