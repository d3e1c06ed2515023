//! Frame codec for the meter's serial protocol.
//!
//! Every frame is `0xAA | len (u16 LE) | payload[len] | crc8(payload)`.
//! The CRC is CRC-8 with polynomial 0x85, initial value 0, no reflection.

use thiserror::Error;

/// First byte of every frame.
pub const FRAME_START: u8 = 0xAA;

/// Start byte plus the little-endian length.
pub const HEADER_SIZE: usize = 3;

/// Largest payload the meter ever sends.
pub const MAX_PAYLOAD: usize = 256;

const CRC8_POLY: u8 = 0x85;

/// Errors that can occur while decoding a frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame start byte: {found:#04x}")]
    BadHeader { found: u8 },

    #[error("frame payload too long: {len} bytes")]
    TooLong { len: usize },

    #[error("crc mismatch: computed {computed:#04x}, received {received:#04x}")]
    Crc { computed: u8, received: u8 },
}

/// CRC-8 over `data`.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Wrap `payload` into a complete frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len())
        .ok()
        .filter(|&len| usize::from(len) <= MAX_PAYLOAD)
        .ok_or(FrameError::TooLong { len: payload.len() })?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + 1);
    frame.push(FRAME_START);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(crc8(payload));
    Ok(frame)
}

/// Validate a frame header and return the payload length it announces.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> Result<usize, FrameError> {
    if header[0] != FRAME_START {
        return Err(FrameError::BadHeader { found: header[0] });
    }

    let len = usize::from(u16::from_le_bytes([header[1], header[2]]));
    if len > MAX_PAYLOAD {
        return Err(FrameError::TooLong { len });
    }

    Ok(len)
}

/// Check the trailing CRC byte against the payload.
pub fn verify(payload: &[u8], received: u8) -> Result<(), FrameError> {
    let computed = crc8(payload);
    if computed != received {
        return Err(FrameError::Crc { computed, received });
    }
    Ok(())
}

/// Read an unsigned little-endian integer of up to 8 bytes.
pub fn read_uint_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
