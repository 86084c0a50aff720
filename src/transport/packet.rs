//! Fragment header for the UDP frame protocol

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Size of [`PacketHeader`] on the wire
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload bytes per datagram
pub const MAX_CHUNK: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("payload length {len} exceeds maximum chunk {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("packet index {index} out of range for {total} packets")]
    IndexOutOfRange { index: u16, total: u16 },

    #[error("header declares {declared} payload bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Fixed-size header preceding every fragment
///
/// ```text
///  0               2               4               6               8
/// +---------------+---------------+---------------+---------------+
/// |   frame_id    | packet_index  | total_packets |  payload_len  |
/// +---------------+---------------+---------------+---------------+
/// ```
/// All fields are little-endian `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u16,
    pub packet_index: u16,
    pub total_packets: u16,
    pub payload_len: u16,
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.frame_id.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.packet_index.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.total_packets.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.frame_id);
        buf.put_u16_le(self.packet_index);
        buf.put_u16_le(self.total_packets);
        buf.put_u16_le(self.payload_len);
    }

    /// Parses the header fields without checking them
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated(data.len()));
        }

        Ok(Self {
            frame_id: u16::from_le_bytes([data[0], data[1]]),
            packet_index: u16::from_le_bytes([data[2], data[3]]),
            total_packets: u16::from_le_bytes([data[4], data[5]]),
            payload_len: u16::from_le_bytes([data[6], data[7]]),
        })
    }
}

/// Splits a datagram into its validated header and payload
pub fn decode_datagram(
    data: &[u8],
    max_chunk: usize,
) -> Result<(PacketHeader, &[u8]), PacketError> {
    let header = PacketHeader::from_bytes(data)?;
    let payload = &data[HEADER_SIZE..];
    let declared = header.payload_len as usize;

    if declared > max_chunk {
        return Err(PacketError::PayloadTooLarge {
            len: declared,
            max: max_chunk,
        });
    }

    if header.packet_index >= header.total_packets {
        return Err(PacketError::IndexOutOfRange {
            index: header.packet_index,
            total: header.total_packets,
        });
    }

    if payload.len() != declared {
        return Err(PacketError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    Ok((header, payload))
}
