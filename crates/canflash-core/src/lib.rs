//! CanFlash-Core: firmware update over a CAN bootloader link.
//!
//! This crate implements the host side of a dual-bank CAN bootloader used
//! by the instrument: the serial adapter frame codec, the identifier table
//! and device diagnostics, and the update session that drives a device
//! from application mode to a verified new image.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Frame codec, identifier table, status codes, error decoding
//! - **Transport**: CAN link abstraction, message hub (serial adapter, mock)
//! - **Payload**: Firmware image, CRC32, chunking
//! - **Bank**: Bank and bootloader information model
//! - **State**: Update phases and phase handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use canflash_core::{FirmwareImage, SerialTransport, SessionConfig, UpdateSession};
//!
//! let config = SessionConfig::default();
//! let transport = Arc::new(SerialTransport::open("/dev/ttyUSB0", config.baud_rate)?);
//! let image = FirmwareImage::load("app.bin", config.max_firmware_size)?;
//!
//! let mut session = UpdateSession::new(transport, config);
//! let report = session.run(image)?;
//! println!("{}", report);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bank;
pub mod config;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use bank::{BankInfo, BootInfo, BootInfoError, Version};
pub use config::SessionConfig;
pub use error::{UpdateError, UpdateResult};
pub use events::{
    LogLevel, MessageDirection, NullObserver, TracingObserver, UpdateEvent, UpdateObserver,
};
pub use payload::{FirmwareError, FirmwareImage};
pub use protocol::{
    BootloaderStatus, CanMessage, DeviceError, FrameError, MessageKind, describe, describe_status,
};
pub use session::{UpdateHandle, UpdateReport, UpdateSession, spawn_update};
pub use state::UpdatePhase;
pub use transport::{
    CanTransport, CancelToken, MessageHub, MockTransport, SerialTransport, SimulatedDevice,
    TransportError, list_ports,
};
