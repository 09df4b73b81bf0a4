//! Human-readable decoding of device messages.
//!
//! Error reports carry fixed payload layouts; [`DeviceError::decode`] turns
//! them into structured values and [`describe`] renders any message for
//! the operator.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::message::MessageKind;
use super::status::{BootloaderStatus, describe_status};

/// Structured form of a device-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    SequenceMismatch {
        expected: Option<u8>,
        received: Option<u8>,
    },
    SizeMismatch {
        expected: Option<u32>,
        received: Option<u32>,
    },
    FlashErase {
        address: Option<u32>,
    },
    FlashWrite {
        address: Option<u32>,
    },
    Validation {
        stack_pointer: Option<u32>,
        reset_vector: Option<u32>,
    },
    BufferOverflow,
}

impl DeviceError {
    /// Decode an error report. Returns `None` for identifiers that are not errors.
    pub fn decode(id: u16, payload: &[u8]) -> Option<Self> {
        let err = match id {
            ERR_SEQUENCE_MISMATCH => {
                if payload.len() >= 2 {
                    DeviceError::SequenceMismatch {
                        expected: Some(payload[0]),
                        received: Some(payload[1]),
                    }
                } else {
                    DeviceError::SequenceMismatch {
                        expected: None,
                        received: None,
                    }
                }
            }
            ERR_SIZE_MISMATCH => {
                if payload.len() >= 8 {
                    DeviceError::SizeMismatch {
                        expected: Some(LittleEndian::read_u32(&payload[0..4])),
                        received: Some(LittleEndian::read_u32(&payload[4..8])),
                    }
                } else {
                    DeviceError::SizeMismatch {
                        expected: None,
                        received: None,
                    }
                }
            }
            ERR_FLASH_WRITE => {
                if payload.first() == Some(&FLASH_ERASE_MARKER) {
                    DeviceError::FlashErase {
                        address: (payload.len() >= 5).then(|| LittleEndian::read_u32(&payload[1..5])),
                    }
                } else {
                    DeviceError::FlashWrite {
                        address: (payload.len() >= 4).then(|| LittleEndian::read_u32(&payload[0..4])),
                    }
                }
            }
            ERR_VALIDATION => {
                if payload.len() >= 8 {
                    DeviceError::Validation {
                        stack_pointer: Some(LittleEndian::read_u32(&payload[0..4])),
                        reset_vector: Some(LittleEndian::read_u32(&payload[4..8])),
                    }
                } else {
                    DeviceError::Validation {
                        stack_pointer: None,
                        reset_vector: None,
                    }
                }
            }
            ERR_BUFFER_OVERFLOW => DeviceError::BufferOverflow,
            _ => return None,
        };
        Some(err)
    }

    /// Recovered locally by resending the current chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::SequenceMismatch { .. })
    }

    /// Display status the device is left in after this error.
    pub fn status(&self) -> BootloaderStatus {
        match self {
            DeviceError::FlashErase { .. }
            | DeviceError::FlashWrite { .. }
            | DeviceError::BufferOverflow => BootloaderStatus::FailedFlash,
            DeviceError::SequenceMismatch { .. }
            | DeviceError::SizeMismatch { .. }
            | DeviceError::Validation { .. } => BootloaderStatus::FailedChecksum,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DeviceError::SequenceMismatch {
                expected: Some(e),
                received: Some(r),
            } => write!(f, "Sequence Mismatch: Expected {}, Received {} (Auto-retrying)", e, r),
            DeviceError::SequenceMismatch { .. } => write!(f, "Sequence Mismatch (Auto-retrying)"),
            DeviceError::SizeMismatch {
                expected: Some(e),
                received: Some(r),
            } => write!(f, "Size Mismatch: Expected {} bytes, Received {} bytes", e, r),
            DeviceError::SizeMismatch { .. } => write!(f, "Size Mismatch"),
            DeviceError::FlashErase { address: Some(a) } => {
                write!(f, "Flash Erase Failed at Address 0x{:08X}", a)
            }
            DeviceError::FlashErase { address: None } => write!(f, "Flash Erase Failed"),
            DeviceError::FlashWrite { address: Some(a) } => {
                write!(f, "Flash Write Failed at Address 0x{:08X}", a)
            }
            DeviceError::FlashWrite { address: None } => write!(f, "Flash Write Failed"),
            DeviceError::Validation {
                stack_pointer: Some(sp),
                reset_vector: Some(rv),
            } => write!(
                f,
                "Firmware Validation Failed: Stack Pointer 0x{:08X}, Reset Vector 0x{:08X}",
                sp, rv
            ),
            DeviceError::Validation { .. } => {
                write!(f, "Firmware Validation Failed: Invalid Firmware Header")
            }
            DeviceError::BufferOverflow => {
                write!(f, "Buffer Overflow: Device receive buffer full (sending too fast)")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Describe any message for the operator.
pub fn describe(id: u16, payload: &[u8]) -> String {
    let Some(kind) = MessageKind::from_id(id) else {
        return format!("Error (ID: 0x{:03X})", id);
    };

    if let Some(err) = DeviceError::decode(id, payload) {
        return err.to_string();
    }

    let status = || {
        payload
            .first()
            .map(|&b| describe_status(b))
            .unwrap_or_else(|| "No Status".to_string())
    };

    match kind {
        MessageKind::PingResponse => format!("Ping Response: {}", status()),
        MessageKind::BeginResponse => format!("Begin Response: {}", status()),
        MessageKind::EndResponse => format!("End Response: {}", status()),
        MessageKind::Progress => match payload.first() {
            Some(seq) => format!("Progress: Sequence {} Acknowledged", seq),
            None => "Progress".to_string(),
        },
        MessageKind::QueryResponse => match payload.first() {
            Some(sel) => format!("Boot Info Record 0x{:02X}", sel),
            None => "Boot Info".to_string(),
        },
        MessageKind::BeginUpdate if payload.len() >= 4 => {
            format!("Begin Update: {} bytes", LittleEndian::read_u32(&payload[0..4]))
        }
        MessageKind::EndUpdate if payload.len() >= 4 => {
            format!("End Update: CRC32 0x{:08X}", LittleEndian::read_u32(&payload[0..4]))
        }
        MessageKind::Data => match payload.split_first() {
            Some((seq, data)) => format!("Data: Sequence {}, {} bytes", seq, data.len()),
            None => "Data".to_string(),
        },
        other => format!("Command: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_mismatch_text() {
        assert_eq!(
            describe(ERR_SEQUENCE_MISMATCH, &[0x05, 0x07]),
            "Sequence Mismatch: Expected 5, Received 7 (Auto-retrying)"
        );
        assert_eq!(
            describe(ERR_SEQUENCE_MISMATCH, &[0x05]),
            "Sequence Mismatch (Auto-retrying)"
        );
        assert!(DeviceError::decode(ERR_SEQUENCE_MISMATCH, &[]).unwrap().is_retryable());
    }

    #[test]
    fn test_size_mismatch_fields() {
        let err = DeviceError::decode(ERR_SIZE_MISMATCH, &[0x01, 0, 0, 0, 0x02, 0, 0, 0]).unwrap();
        assert_eq!(
            err,
            DeviceError::SizeMismatch {
                expected: Some(1),
                received: Some(2)
            }
        );
        assert_eq!(err.to_string(), "Size Mismatch: Expected 1 bytes, Received 2 bytes");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_flash_write_and_erase_variants() {
        let write = DeviceError::decode(ERR_FLASH_WRITE, &[0x00, 0x40, 0x00, 0x08]).unwrap();
        assert_eq!(write, DeviceError::FlashWrite { address: Some(0x0800_4000) });
        assert_eq!(write.to_string(), "Flash Write Failed at Address 0x08004000");

        let erase = DeviceError::decode(ERR_FLASH_WRITE, &[b'E', 0x00, 0x80, 0x00, 0x08]).unwrap();
        assert_eq!(erase, DeviceError::FlashErase { address: Some(0x0800_8000) });
        assert_eq!(erase.status(), BootloaderStatus::FailedFlash);

        assert_eq!(describe(ERR_FLASH_WRITE, &[1, 2]), "Flash Write Failed");
    }

    #[test]
    fn test_validation_variants() {
        let payload = [0x00, 0x50, 0x00, 0x20, 0xC1, 0x40, 0x00, 0x08];
        assert_eq!(
            describe(ERR_VALIDATION, &payload),
            "Firmware Validation Failed: Stack Pointer 0x20005000, Reset Vector 0x080040C1"
        );
        assert_eq!(
            describe(ERR_VALIDATION, &[]),
            "Firmware Validation Failed: Invalid Firmware Header"
        );
    }

    #[test]
    fn test_buffer_overflow_and_unknown() {
        assert!(describe(ERR_BUFFER_OVERFLOW, &[]).starts_with("Buffer Overflow"));
        assert_eq!(describe(0x123, &[1, 2, 3]), "Error (ID: 0x123)");
        assert_eq!(DeviceError::decode(RSP_PING, &[1]), None);
    }

    #[test]
    fn test_every_kind_is_described() {
        for kind in MessageKind::ALL {
            let text = describe(kind.id(), &[]);
            assert!(!text.starts_with("Error (ID"), "{kind:?} fell through to fallback");
        }
        assert_eq!(describe(RSP_PING, &[0x01]), "Ping Response: Ready");
        assert_eq!(describe(RSP_END, &[0x42]), "End Response: Unknown (0x42)");
    }
}
