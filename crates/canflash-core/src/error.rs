//! Update session error types.

use thiserror::Error;

use crate::bank::BootInfoError;
use crate::payload::FirmwareError;
use crate::protocol::{BootloaderStatus, DeviceError};
use crate::state::machine::UpdatePhase;
use crate::transport::TransportError;

/// Result type alias for session operations.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors that end an update session.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// No response within the phase deadline.
    #[error("Timeout during {phase}: no {expected} within {timeout_ms}ms")]
    Timeout {
        phase: UpdatePhase,
        expected: &'static str,
        timeout_ms: u64,
    },

    /// Fatal error reported by the device.
    #[error("{0}")]
    Device(DeviceError),

    /// A chunk kept failing its sequence check.
    #[error(
        "Retries exhausted: chunk {chunk} (sequence {sequence}) rejected after {attempts} resends. Last error: {last}"
    )]
    RetriesExhausted {
        chunk: usize,
        sequence: u8,
        attempts: u8,
        last: String,
    },

    /// Response that makes no sense in the current phase.
    #[error("Unexpected response during {phase}: {description}")]
    UnexpectedResponse {
        phase: UpdatePhase,
        id: u16,
        description: String,
    },

    /// Ping answered with something other than ready.
    #[error("Device not ready: {description}")]
    NotReady { status: u8, description: String },

    /// Begin-update refused.
    #[error("Device rejected update: {description}")]
    Rejected { status: u8, description: String },

    /// End-of-update verification failed on the device.
    #[error("Verification failed: {description}")]
    VerificationFailed { status: u8, description: String },

    #[error("Malformed boot info: {0}")]
    BootInfo(#[from] BootInfoError),

    #[error("Firmware error: {0}")]
    Firmware(#[from] FirmwareError),

    /// Operator abort.
    #[error("Update aborted by user")]
    Aborted,

    /// Another session already drives this link.
    #[error("Another update session is already active on this link")]
    SessionActive,

    /// Operation needs an idle session.
    #[error("Session is not idle (current phase: {0})")]
    NotIdle(UpdatePhase),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl UpdateError {
    /// Display status after this failure.
    pub fn status(&self) -> BootloaderStatus {
        match self {
            UpdateError::Timeout { .. }
            | UpdateError::NotReady { .. }
            | UpdateError::Transport(_) => BootloaderStatus::FailedTimeout,
            UpdateError::Device(e) => e.status(),
            UpdateError::Rejected { status, .. } | UpdateError::VerificationFailed { status, .. } => {
                BootloaderStatus::from_u8(*status)
                    .filter(|s| s.is_failure())
                    .unwrap_or(BootloaderStatus::FailedFlash)
            }
            UpdateError::UnexpectedResponse { .. } | UpdateError::BootInfo(_) => {
                BootloaderStatus::FailedTimeout
            }
            UpdateError::RetriesExhausted { .. } | UpdateError::Firmware(_) => {
                BootloaderStatus::FailedChecksum
            }
            UpdateError::Aborted | UpdateError::SessionActive | UpdateError::NotIdle(_) => {
                BootloaderStatus::Idle
            }
        }
    }

    /// Operator-facing diagnostic.
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ERR_FLASH_WRITE;

    #[test]
    fn test_device_error_renders_decoded_text() {
        let err = UpdateError::Device(
            DeviceError::decode(ERR_FLASH_WRITE, &[0x00, 0x10, 0x00, 0x08]).unwrap(),
        );
        assert_eq!(err.diagnostic(), "Flash Write Failed at Address 0x08001000");
        assert_eq!(err.status(), BootloaderStatus::FailedFlash);
    }

    #[test]
    fn test_status_mapping() {
        let timeout = UpdateError::Timeout {
            phase: UpdatePhase::Pinging,
            expected: "ping response",
            timeout_ms: 100,
        };
        assert_eq!(timeout.status(), BootloaderStatus::FailedTimeout);
        assert!(timeout.diagnostic().contains("Pinging"));

        let verify = UpdateError::VerificationFailed {
            status: BootloaderStatus::FailedChecksum.as_u8(),
            description: "Failed: Checksum".into(),
        };
        assert_eq!(verify.status(), BootloaderStatus::FailedChecksum);

        let odd = UpdateError::Rejected {
            status: 0x55,
            description: "Unknown (0x55)".into(),
        };
        assert_eq!(odd.status(), BootloaderStatus::FailedFlash);
    }
}
