//! Bank and bootloader status model.
//!
//! Passive record of what the device reports about its two firmware banks.
//! Built from query-info records and updated by end-of-update responses.
//!
//! Query-info records (`RSP_QUERY`), selected by the first payload byte:
//!
//! | Selector | Layout                                              |
//! |----------|-----------------------------------------------------|
//! | `0x00`   | summary: active bank, status, bootloader version    |
//! | `0x1n`   | bank n: valid flag, version major/minor/patch       |
//! | `0x2n`   | bank n: CRC32 (u32 LE)                              |
//! | `0x3n`   | bank n: size in bytes (u32 LE)                      |
//! | `0x4n`   | bank n: last update, unix seconds (u32 LE)          |
//!
//! The summary record is sent last and terminates the query.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::constants::BANK_COUNT;
use crate::protocol::status::{BootloaderStatus, describe_status};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootInfoError {
    #[error("Empty boot info record")]
    Empty,
    #[error("Boot info record 0x{selector:02X} too short: expected {expected} bytes, got {actual}")]
    TooShort {
        selector: u8,
        expected: usize,
        actual: usize,
    },
    #[error("Boot info record 0x{selector:02X} names bank {bank}, device has 2 banks")]
    BadBank { selector: u8, bank: usize },
    #[error("Unknown boot info record 0x{0:02X}")]
    UnknownRecord(u8),
}

/// Firmware version triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One firmware bank as reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BankInfo {
    pub index: u8,
    pub valid: bool,
    pub version: Version,
    pub crc32: u32,
    pub size: u32,
    /// Last update, unix seconds. Zero when never written.
    pub timestamp: u32,
}

impl BankInfo {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn label(&self) -> String {
        match self.index {
            0 => "Bank A".to_string(),
            1 => "Bank B".to_string(),
            n => format!("Bank {}", n),
        }
    }

    pub fn status_glyph(&self) -> &'static str {
        if self.valid { "✓" } else { "✗" }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp == 0 {
            return None;
        }
        DateTime::from_timestamp(self.timestamp as i64, 0)
    }
}

impl fmt::Display for BankInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} v{} size={} crc=0x{:08X}",
            self.label(),
            self.status_glyph(),
            self.version,
            self.size,
            self.crc32
        )?;
        match self.updated_at() {
            Some(ts) => write!(f, " updated={}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
            None => write!(f, " updated=never"),
        }
    }
}

/// Aggregate of everything the bootloader reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub banks: [BankInfo; BANK_COUNT],
    pub active_bank: u8,
    /// Raw status byte; may be out of range for [`BootloaderStatus`].
    pub status_raw: u8,
    pub bootloader_version: Version,
}

impl Default for BootInfo {
    fn default() -> Self {
        Self {
            banks: [BankInfo::new(0), BankInfo::new(1)],
            active_bank: 0,
            status_raw: BootloaderStatus::Idle.as_u8(),
            bootloader_version: Version::default(),
        }
    }
}

impl BootInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<BootloaderStatus> {
        BootloaderStatus::from_u8(self.status_raw)
    }

    pub fn status_text(&self) -> String {
        describe_status(self.status_raw)
    }

    pub fn active(&self) -> Option<&BankInfo> {
        self.banks.get(self.active_bank as usize)
    }

    /// Apply one query-info record. Returns `true` once the summary arrived.
    pub fn apply_record(&mut self, payload: &[u8]) -> Result<bool, BootInfoError> {
        let (&selector, body) = payload.split_first().ok_or(BootInfoError::Empty)?;

        let need = |expected: usize| {
            if payload.len() < expected {
                Err(BootInfoError::TooShort {
                    selector,
                    expected,
                    actual: payload.len(),
                })
            } else {
                Ok(())
            }
        };

        if selector == 0x00 {
            need(6)?;
            self.active_bank = body[0];
            self.status_raw = body[1];
            self.bootloader_version = Version::new(body[2], body[3], body[4]);
            return Ok(true);
        }

        let bank = (selector & 0x0F) as usize;
        if bank >= BANK_COUNT {
            return Err(BootInfoError::BadBank { selector, bank });
        }
        let entry = &mut self.banks[bank];
        entry.index = bank as u8;

        match selector & 0xF0 {
            0x10 => {
                need(5)?;
                entry.valid = body[0] != 0;
                entry.version = Version::new(body[1], body[2], body[3]);
            }
            0x20 => {
                need(5)?;
                entry.crc32 = LittleEndian::read_u32(&body[0..4]);
            }
            0x30 => {
                need(5)?;
                entry.size = LittleEndian::read_u32(&body[0..4]);
            }
            0x40 => {
                need(5)?;
                entry.timestamp = LittleEndian::read_u32(&body[0..4]);
            }
            _ => return Err(BootInfoError::UnknownRecord(selector)),
        }
        Ok(false)
    }

    /// Apply an end-of-update response `[status, bank, crc32 LE]`.
    pub fn apply_end_response(&mut self, payload: &[u8]) {
        let Some(&status) = payload.first() else {
            return;
        };
        self.status_raw = status;

        let Some(&bank) = payload.get(1) else {
            return;
        };
        let Some(entry) = self.banks.get_mut(bank as usize) else {
            tracing::warn!(bank, "End response names unknown bank");
            return;
        };
        entry.valid = status == BootloaderStatus::Success.as_u8();
        if payload.len() >= 6 {
            entry.crc32 = LittleEndian::read_u32(&payload[2..6]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_full_query() {
        let mut info = BootInfo::new();
        assert_eq!(info.apply_record(&[0x11, 1, 2, 3, 4]), Ok(false));
        assert_eq!(info.apply_record(&[0x21, 0x78, 0x56, 0x34, 0x12]), Ok(false));
        assert_eq!(info.apply_record(&[0x31, 0x00, 0x00, 0x01, 0x00]), Ok(false));
        assert_eq!(info.apply_record(&[0x41, 0x00, 0xE1, 0xF5, 0x05]), Ok(false));
        assert_eq!(info.apply_record(&[0x00, 1, 0x01, 1, 0, 7]), Ok(true));

        let bank = &info.banks[1];
        assert!(bank.valid);
        assert_eq!(bank.version, Version::new(2, 3, 4));
        assert_eq!(bank.crc32, 0x1234_5678);
        assert_eq!(bank.size, 0x0001_0000);
        assert_eq!(bank.timestamp, 100_000_000);
        assert_eq!(info.active().map(|b| b.index), Some(1));
        assert_eq!(info.status(), Some(BootloaderStatus::Ready));
        assert_eq!(info.bootloader_version.to_string(), "1.0.7");
    }

    #[test]
    fn test_record_errors() {
        let mut info = BootInfo::new();
        assert_eq!(info.apply_record(&[]), Err(BootInfoError::Empty));
        assert!(matches!(
            info.apply_record(&[0x20, 1]),
            Err(BootInfoError::TooShort { selector: 0x20, .. })
        ));
        assert!(matches!(
            info.apply_record(&[0x12, 1, 0, 0, 0]),
            Err(BootInfoError::BadBank { bank: 2, .. })
        ));
        assert_eq!(
            info.apply_record(&[0x70, 0, 0, 0, 0]),
            Err(BootInfoError::UnknownRecord(0x70))
        );
    }

    #[test]
    fn test_display_strings() {
        let mut bank = BankInfo::new(0);
        assert_eq!(bank.label(), "Bank A");
        assert_eq!(bank.status_glyph(), "✗");
        assert!(bank.to_string().ends_with("updated=never"));

        bank.valid = true;
        bank.timestamp = 86_400;
        assert_eq!(bank.status_glyph(), "✓");
        assert!(bank.to_string().contains("1970-01-02 00:00:00 UTC"));
        assert_eq!(BankInfo::new(1).label(), "Bank B");
    }

    #[test]
    fn test_end_response_updates_bank() {
        let mut info = BootInfo::new();
        info.apply_end_response(&[0x03, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert!(info.banks[0].valid);
        assert_eq!(info.banks[0].crc32, 0xDEAD_BEEF);
        assert_eq!(info.status(), Some(BootloaderStatus::Success));

        info.apply_end_response(&[0x04, 0]);
        assert!(!info.banks[0].valid);
        assert_eq!(info.status_text(), "Failed: Checksum");
    }
}
