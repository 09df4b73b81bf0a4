//! Bootloader status codes reported by the device.

use std::fmt;

/// Display status of the bootloader.
///
/// Only drives what the operator sees; the update session makes its
/// decisions from its own phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BootloaderStatus {
    #[default]
    Idle = 0x00,
    Ready = 0x01,
    InProgress = 0x02,
    Success = 0x03,
    FailedChecksum = 0x04,
    FailedTimeout = 0x05,
    FailedFlash = 0x06,
}

impl BootloaderStatus {
    pub const ALL: [BootloaderStatus; 7] = [
        BootloaderStatus::Idle,
        BootloaderStatus::Ready,
        BootloaderStatus::InProgress,
        BootloaderStatus::Success,
        BootloaderStatus::FailedChecksum,
        BootloaderStatus::FailedTimeout,
        BootloaderStatus::FailedFlash,
    ];

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(BootloaderStatus::Idle),
            0x01 => Some(BootloaderStatus::Ready),
            0x02 => Some(BootloaderStatus::InProgress),
            0x03 => Some(BootloaderStatus::Success),
            0x04 => Some(BootloaderStatus::FailedChecksum),
            0x05 => Some(BootloaderStatus::FailedTimeout),
            0x06 => Some(BootloaderStatus::FailedFlash),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            BootloaderStatus::FailedChecksum
                | BootloaderStatus::FailedTimeout
                | BootloaderStatus::FailedFlash
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            BootloaderStatus::Idle => "Idle",
            BootloaderStatus::Ready => "Ready",
            BootloaderStatus::InProgress => "In Progress",
            BootloaderStatus::Success => "Success",
            BootloaderStatus::FailedChecksum => "Failed: Checksum",
            BootloaderStatus::FailedTimeout => "Failed: Timeout",
            BootloaderStatus::FailedFlash => "Failed: Flash",
        }
    }
}

impl fmt::Display for BootloaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl TryFrom<u8> for BootloaderStatus {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::from_u8(raw).ok_or(raw)
    }
}

/// Describe a raw status byte received from the device.
pub fn describe_status(raw: u8) -> String {
    match BootloaderStatus::from_u8(raw) {
        Some(status) => status.label().to_string(),
        None => format!("Unknown (0x{:02X})", raw),
    }
}
