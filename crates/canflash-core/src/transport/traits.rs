//! CAN transport abstraction.
//!
//! Defines the `CanTransport` trait consumed by the update session,
//! allowing different implementations (serial adapter, mock, etc.).

use std::sync::Arc;

use thiserror::Error;

use super::hub::MessageHub;
use crate::protocol::FrameError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open port '{port}': {message}")]
    OpenFailed { port: String, message: String },

    #[error("Port '{0}' not found")]
    PortNotFound(String),

    #[error("Port '{0}' is busy or in use by another application")]
    PortBusy(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract logical CAN link.
///
/// Implementations own the physical link, run the frame codec and feed
/// every decoded message into their [`MessageHub`].
pub trait CanTransport: Send + Sync {
    /// Send one logical message.
    fn send(&self, id: u16, payload: &[u8]) -> Result<(), TransportError>;

    /// Dispatch point for received messages.
    fn hub(&self) -> &Arc<MessageHub>;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool {
        true
    }
}
