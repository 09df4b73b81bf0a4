//! Simulated bootloader.
//!
//! Answers commands the way the instrument's bootloader does. Used by the
//! mock transport in tests and by the CLI `--simulate` dry run. Faults can
//! be injected to exercise the retry, timeout and fatal-error paths.

use std::collections::{HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::bank::{BankInfo, Version};
use crate::payload::crc32_ieee;
use crate::protocol::constants::*;
use crate::protocol::{BootloaderStatus, CanMessage};

/// State of the simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub banks: [BankInfo; BANK_COUNT],
    pub active_bank: u8,
    pub status: BootloaderStatus,
    pub bootloader_version: Version,
    /// Commands the device never answers.
    silent: HashSet<u16>,
    /// Sequence numbers to reject once with a sequence-mismatch.
    reject_once: HashSet<u8>,
    /// Fatal error to raise when a given chunk sequence arrives.
    fault_on_sequence: HashMap<u8, CanMessage>,
    /// Reported status for BEGIN (defaults to in-progress).
    begin_status: Option<BootloaderStatus>,
    expected_size: u32,
    expected_seq: u8,
    received: Vec<u8>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        let mut bank_a = BankInfo::new(0);
        bank_a.valid = true;
        bank_a.version = Version::new(1, 2, 0);
        bank_a.size = 0x4000;
        bank_a.crc32 = 0x1BAD_B002;
        bank_a.timestamp = 1_700_000_000;

        Self {
            banks: [bank_a, BankInfo::new(1)],
            active_bank: 0,
            status: BootloaderStatus::Ready,
            bootloader_version: Version::new(1, 0, 3),
            silent: HashSet::new(),
            reject_once: HashSet::new(),
            fault_on_sequence: HashMap::new(),
            begin_status: None,
            expected_size: 0,
            expected_seq: 0,
            received: Vec::new(),
        }
    }

    /// Never answer `command`.
    pub fn silent_on(mut self, command: u16) -> Self {
        self.silent.insert(command);
        self
    }

    /// Answer the first data frame with `sequence` with a sequence-mismatch,
    /// as if its sequence byte had been corrupted on the bus.
    pub fn reject_sequence_once(mut self, sequence: u8) -> Self {
        self.reject_once.insert(sequence);
        self
    }

    /// Answer every data frame with `sequence` with a sequence-mismatch.
    pub fn always_reject_sequence(mut self, sequence: u8) -> Self {
        self.fault_on_sequence.insert(
            sequence,
            CanMessage::from_parts(ERR_SEQUENCE_MISMATCH, &[sequence, sequence.wrapping_sub(1)]),
        );
        self
    }

    /// Raise `error` when the data frame with `sequence` arrives.
    pub fn fail_on_sequence(mut self, sequence: u8, error: CanMessage) -> Self {
        self.fault_on_sequence.insert(sequence, error);
        self
    }

    /// Report `status` in the begin response.
    pub fn begin_with(mut self, status: BootloaderStatus) -> Self {
        self.begin_status = Some(status);
        self
    }

    /// Report `status` in ping responses.
    pub fn with_status(mut self, status: BootloaderStatus) -> Self {
        self.status = status;
        self
    }

    fn target_bank(&self) -> u8 {
        (self.active_bank + 1) % BANK_COUNT as u8
    }

    fn boot_info_records(&self) -> Vec<CanMessage> {
        let mut out = Vec::new();
        for bank in &self.banks {
            let n = bank.index;
            out.push(CanMessage::from_parts(
                RSP_QUERY,
                &[
                    0x10 | n,
                    bank.valid as u8,
                    bank.version.major,
                    bank.version.minor,
                    bank.version.patch,
                ],
            ));
            for (selector, value) in [
                (0x20 | n, bank.crc32),
                (0x30 | n, bank.size),
                (0x40 | n, bank.timestamp),
            ] {
                let mut p = [selector, 0, 0, 0, 0];
                LittleEndian::write_u32(&mut p[1..5], value);
                out.push(CanMessage::from_parts(RSP_QUERY, &p));
            }
        }
        out.push(CanMessage::from_parts(
            RSP_QUERY,
            &[
                0x00,
                self.active_bank,
                self.status.as_u8(),
                self.bootloader_version.major,
                self.bootloader_version.minor,
                self.bootloader_version.patch,
            ],
        ));
        out
    }

    /// Replies to one host message.
    pub fn respond(&mut self, msg: &CanMessage) -> Vec<CanMessage> {
        if self.silent.contains(&msg.id()) {
            debug!(id = %format!("0x{:03X}", msg.id()), "Simulated device ignoring command");
            return Vec::new();
        }

        let p = msg.payload();
        match msg.id() {
            CMD_ENTER_BOOTLOADER => {
                if self.status != BootloaderStatus::InProgress {
                    self.status = BootloaderStatus::Ready;
                }
                Vec::new()
            }
            CMD_QUERY_INFO => self.boot_info_records(),
            CMD_PING => vec![CanMessage::from_parts(RSP_PING, &[self.status.as_u8()])],
            CMD_BEGIN_UPDATE => {
                self.expected_size = if p.len() >= 4 {
                    LittleEndian::read_u32(&p[0..4])
                } else {
                    0
                };
                self.expected_seq = 0;
                self.received.clear();
                let status = self.begin_status.unwrap_or(BootloaderStatus::InProgress);
                self.status = status;
                vec![CanMessage::from_parts(
                    RSP_BEGIN,
                    &[status.as_u8(), self.target_bank()],
                )]
            }
            CMD_DATA => self.on_data(p),
            CMD_END_UPDATE => self.on_end(p),
            CMD_RESET => {
                self.status = BootloaderStatus::Idle;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_data(&mut self, p: &[u8]) -> Vec<CanMessage> {
        let Some((&seq, data)) = p.split_first() else {
            return Vec::new();
        };

        if let Some(fault) = self.fault_on_sequence.get(&seq) {
            return vec![*fault];
        }
        let seen = if seq == self.expected_seq && self.reject_once.remove(&seq) {
            seq.wrapping_add(1)
        } else {
            seq
        };
        if seen != self.expected_seq {
            return vec![CanMessage::from_parts(
                ERR_SEQUENCE_MISMATCH,
                &[self.expected_seq, seen],
            )];
        }

        self.received.extend_from_slice(data);
        self.expected_seq = self.expected_seq.wrapping_add(1);

        let mut ack = [seq, 0, 0, 0, 0];
        LittleEndian::write_u32(&mut ack[1..5], self.received.len() as u32);
        vec![CanMessage::from_parts(RSP_PROGRESS, &ack)]
    }

    fn on_end(&mut self, p: &[u8]) -> Vec<CanMessage> {
        let received = self.received.len() as u32;
        if received != self.expected_size {
            let mut err = [0u8; 8];
            LittleEndian::write_u32(&mut err[0..4], self.expected_size);
            LittleEndian::write_u32(&mut err[4..8], received);
            self.status = BootloaderStatus::FailedChecksum;
            return vec![CanMessage::from_parts(ERR_SIZE_MISMATCH, &err)];
        }

        let crc = crc32_ieee(&self.received);
        let host_crc = if p.len() >= 4 {
            LittleEndian::read_u32(&p[0..4])
        } else {
            0
        };
        let bank = self.target_bank();

        self.status = if crc == host_crc {
            let entry = &mut self.banks[bank as usize];
            entry.valid = true;
            entry.crc32 = crc;
            entry.size = received;
            BootloaderStatus::Success
        } else {
            BootloaderStatus::FailedChecksum
        };

        let mut rsp = [self.status.as_u8(), bank, 0, 0, 0, 0];
        LittleEndian::write_u32(&mut rsp[2..6], crc);
        vec![CanMessage::from_parts(RSP_END, &rsp)]
    }
}
