//! Update session phases and mutable transfer state.

use std::fmt;
use std::time::Instant;

use crate::payload::FirmwareImage;
use crate::protocol::BootloaderStatus;

/// Phase of the update session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdatePhase {
    #[default]
    Idle,
    EnteringBootloader,
    QueryingInfo,
    Pinging,
    Beginning,
    Transferring,
    Ending,
    Verifying,
    Success,
    Failed,
}

impl UpdatePhase {
    pub const ALL: [UpdatePhase; 10] = [
        UpdatePhase::Idle,
        UpdatePhase::EnteringBootloader,
        UpdatePhase::QueryingInfo,
        UpdatePhase::Pinging,
        UpdatePhase::Beginning,
        UpdatePhase::Transferring,
        UpdatePhase::Ending,
        UpdatePhase::Verifying,
        UpdatePhase::Success,
        UpdatePhase::Failed,
    ];

    /// Terminal until an explicit reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatePhase::Success | UpdatePhase::Failed)
    }

    /// Allowed transitions: forward along the update order, any phase to
    /// `Failed`, terminal phases back to `Idle`.
    pub fn can_transition_to(self, to: UpdatePhase) -> bool {
        use UpdatePhase::*;
        match (self, to) {
            (_, Failed) => true,
            (Success | Failed, Idle) => true,
            (Idle, EnteringBootloader)
            | (EnteringBootloader, QueryingInfo)
            | (QueryingInfo, Pinging)
            | (Pinging, Beginning)
            | (Beginning, Transferring)
            | (Transferring, Ending)
            | (Ending, Verifying)
            | (Verifying, Success) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "Idle"),
            UpdatePhase::EnteringBootloader => write!(f, "Entering Bootloader"),
            UpdatePhase::QueryingInfo => write!(f, "Querying Info"),
            UpdatePhase::Pinging => write!(f, "Pinging"),
            UpdatePhase::Beginning => write!(f, "Beginning"),
            UpdatePhase::Transferring => write!(f, "Transferring"),
            UpdatePhase::Ending => write!(f, "Ending"),
            UpdatePhase::Verifying => write!(f, "Verifying"),
            UpdatePhase::Success => write!(f, "Success"),
            UpdatePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Mutable state of the in-flight update.
#[derive(Debug, Default)]
pub struct TransferState {
    /// Image being flashed.
    pub image: Option<FirmwareImage>,
    pub total_size: u64,
    pub bytes_acknowledged: u64,
    /// Index of the in-flight chunk.
    pub current_chunk: usize,
    pub total_chunks: usize,
    /// Sequence byte of the in-flight chunk.
    pub sequence: u8,
    /// Sequence-mismatch resends of the in-flight chunk.
    pub retries: u8,
    /// Resends over the whole transfer.
    pub total_retries: u32,
    /// Deadline of the response currently awaited.
    pub deadline: Option<Instant>,
    /// Last status byte the device reported.
    pub last_device_status: Option<u8>,
    /// Bank the device is writing, from the begin response.
    pub target_bank: Option<u8>,
    /// CRC32 of the whole image.
    pub crc32: u32,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, image: FirmwareImage) {
        *self = Self {
            total_size: image.len() as u64,
            total_chunks: image.chunk_count(),
            crc32: image.crc32(),
            image: Some(image),
            ..Default::default()
        };
    }

    pub fn start_chunk(&mut self, index: usize, sequence: u8) {
        self.current_chunk = index;
        self.sequence = sequence;
        self.retries = 0;
    }

    /// Count a resend. Returns `false` once `max` resends are used up.
    pub fn record_retry(&mut self, max: u8) -> bool {
        if self.retries >= max {
            return false;
        }
        self.retries += 1;
        self.total_retries += 1;
        true
    }

    pub fn acknowledge(&mut self, bytes: usize) {
        self.bytes_acknowledged += bytes as u64;
        self.retries = 0;
    }

    /// Fraction acknowledged, 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.bytes_acknowledged as f64 / self.total_size as f64).min(1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.total_size > 0 && self.bytes_acknowledged >= self.total_size
    }

    pub fn set_device_status(&mut self, raw: u8) -> Option<BootloaderStatus> {
        self.last_device_status = Some(raw);
        BootloaderStatus::from_u8(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpdatePhase::*;

    #[test]
    fn test_forward_path_allowed() {
        let path = [
            Idle,
            EnteringBootloader,
            QueryingInfo,
            Pinging,
            Beginning,
            Transferring,
            Ending,
            Verifying,
            Success,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_backwards_or_skips() {
        assert!(!Transferring.can_transition_to(Beginning));
        assert!(!Idle.can_transition_to(Transferring));
        assert!(!Pinging.can_transition_to(Idle));
        assert!(!Success.can_transition_to(Transferring));
        for phase in UpdatePhase::ALL {
            assert!(phase.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_retry_bound_and_reset_on_ack() {
        let mut state = TransferState::new();
        state.load(FirmwareImage::from_bytes(vec![0; 10]).unwrap());
        assert_eq!(state.total_chunks, 2);

        state.start_chunk(0, 0);
        assert!(state.record_retry(2));
        assert!(state.record_retry(2));
        assert!(!state.record_retry(2));
        assert_eq!(state.retries, 2);

        state.acknowledge(7);
        assert_eq!(state.retries, 0);
        assert_eq!(state.total_retries, 2);
        assert!((state.progress() - 0.7).abs() < 1e-9);
        assert!(!state.is_complete());
    }
}
