//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow an update without tight coupling
//! to the session logic.

use std::fmt;

use crate::bank::BootInfo;
use crate::protocol::BootloaderStatus;
pub use crate::state::machine::UpdatePhase;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// CAN message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageDirection::Tx => write!(f, "TX"),
            MessageDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the update session.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// Transfer progress; `fraction` is 0.0 to 1.0.
    Progress {
        acknowledged: u64,
        total: u64,
        fraction: f64,
    },
    /// Chunk resent after a sequence mismatch.
    Retry {
        chunk: usize,
        sequence: u8,
        attempt: u8,
        max: u8,
        diagnostic: String,
    },
    /// Bank/bootloader information refreshed.
    BootInfo(BootInfo),
    /// Display status changed.
    StatusChanged(BootloaderStatus),
    /// CAN message sent/received.
    Message {
        direction: MessageDirection,
        id: u16,
        payload: Vec<u8>,
        description: String,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Session reached a terminal outcome.
    Finished {
        status: BootloaderStatus,
        error: Option<String>,
    },
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::Progress {
                acknowledged,
                total,
                fraction,
            } => {
                tracing::debug!(
                    acknowledged,
                    total,
                    progress = %format!("{:.1}%", fraction * 100.0),
                    "Progress"
                );
            }
            UpdateEvent::Retry {
                chunk,
                sequence,
                attempt,
                max,
                diagnostic,
            } => {
                tracing::warn!(chunk, sequence, attempt, max, "{}", diagnostic);
            }
            UpdateEvent::BootInfo(info) => {
                for bank in &info.banks {
                    tracing::info!(active = bank.index == info.active_bank, "{}", bank);
                }
                tracing::info!(
                    status = %info.status_text(),
                    bootloader = %info.bootloader_version,
                    "Boot info"
                );
            }
            UpdateEvent::StatusChanged(status) => {
                tracing::debug!(status = %status, "Status changed");
            }
            UpdateEvent::Message {
                direction,
                id,
                payload,
                description,
            } => {
                tracing::trace!(
                    dir = %direction,
                    id = %format!("0x{:03X}", id),
                    len = payload.len(),
                    "{}",
                    description
                );
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Finished { status, error } => match error {
                Some(e) => tracing::error!(status = %status, "Update failed: {}", e),
                None => tracing::info!(status = %status, "Update finished"),
            },
        }
    }
}
