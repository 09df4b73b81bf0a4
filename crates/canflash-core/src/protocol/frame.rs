//! Physical frame codec.
//!
//! Layout of a canonical 20-byte frame:
//!
//! ```text
//! [0]      0xAA start marker
//! [1]      0xC0 | payload length
//! [2..4]   identifier, u16 LE (11 bits used)
//! [4..12]  payload, zero padded to 8 bytes
//! [12]     0x55 end marker
//! [13..20] reserved, zero
//! ```

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::*;
use super::message::CanMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: expected at least {minimum} bytes, got {actual}")]
    TooShort { minimum: usize, actual: usize },
    #[error("Bad start marker: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadStartMarker { expected: u8, actual: u8 },
    #[error("Identifier 0x{0:03X} exceeds 11 bits")]
    IdentifierOutOfRange(u16),
    #[error("Payload too long: {0} bytes (max 8)")]
    PayloadTooLong(usize),
    #[error("Invalid hex dump: {0}")]
    InvalidHex(String),
}

/// Decode a physical frame into its identifier and payload.
///
/// A declared length above 8 is truncated to 8 rather than rejected. An
/// identifier wider than 11 bits is rejected, not masked.
pub fn decode(bytes: &[u8]) -> Result<CanMessage, FrameError> {
    if bytes.len() < FRAME_MIN_DECODE_LEN {
        return Err(FrameError::TooShort {
            minimum: FRAME_MIN_DECODE_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != FRAME_START {
        return Err(FrameError::BadStartMarker {
            expected: FRAME_START,
            actual: bytes[0],
        });
    }

    let id = LittleEndian::read_u16(&bytes[FRAME_ID_OFFSET..FRAME_DATA_OFFSET]);
    if id > MAX_IDENTIFIER {
        return Err(FrameError::IdentifierOutOfRange(id));
    }
    let declared = (bytes[1] & FRAME_LEN_MASK) as usize;
    let len = declared.min(MAX_PAYLOAD_LEN);
    if declared > MAX_PAYLOAD_LEN {
        tracing::warn!(declared, "Frame declares oversized payload, truncating to 8");
    }

    Ok(CanMessage::from_parts(
        id,
        &bytes[FRAME_DATA_OFFSET..FRAME_DATA_OFFSET + len],
    ))
}

/// Encode an identifier and payload into a canonical physical frame.
pub fn encode(id: u16, payload: &[u8]) -> Result<[u8; FRAME_LEN], FrameError> {
    if id > MAX_IDENTIFIER {
        return Err(FrameError::IdentifierOutOfRange(id));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }

    let mut frame = [0u8; FRAME_LEN];
    frame[0] = FRAME_START;
    frame[1] = FRAME_HEADER_BASE | payload.len() as u8;
    LittleEndian::write_u16(&mut frame[FRAME_ID_OFFSET..FRAME_DATA_OFFSET], id);
    frame[FRAME_DATA_OFFSET..FRAME_DATA_OFFSET + payload.len()].copy_from_slice(payload);
    frame[FRAME_BLOCK_LEN] = FRAME_END;
    Ok(frame)
}

/// Parse a hex dump such as `"AA C2 81 07"`, `"aac28107"` or `"0xAA,0xC2"`.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, FrameError> {
    let digits: String = text
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .map(|tok| tok.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();

    if digits.len() % 2 != 0 {
        return Err(FrameError::InvalidHex(format!(
            "odd number of digits ({})",
            digits.len()
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| FrameError::InvalidHex(format!("bad byte at offset {}", i / 2)))
        })
        .collect()
}

/// Reassembles frames from a raw serial byte stream.
///
/// Bytes before a start marker are discarded. A marker is only trusted when
/// the end marker sits at [`FRAME_BLOCK_LEN`] after it; otherwise one byte
/// is dropped and the scan resumes. A frame is emitted once [`FRAME_LEN`]
/// bytes starting at the marker have arrived.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    discarded: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and return every complete frame.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            match self.buf.iter().position(|&b| b == FRAME_START) {
                Some(0) => {}
                Some(start) => {
                    self.discarded += start;
                    self.buf.drain(..start);
                }
                None => {
                    self.discarded += self.buf.len();
                    self.buf.clear();
                    break;
                }
            }
            if self.buf.len() <= FRAME_BLOCK_LEN {
                break;
            }
            if self.buf[FRAME_BLOCK_LEN] != FRAME_END {
                self.discarded += 1;
                self.buf.drain(..1);
                continue;
            }
            if self.buf.len() < FRAME_LEN {
                break;
            }
            frames.push(self.buf.drain(..FRAME_LEN).collect());
        }

        frames
    }

    /// Bytes thrown away while hunting for a start marker.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
