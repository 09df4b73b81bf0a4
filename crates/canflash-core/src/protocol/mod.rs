//! Protocol module - bootloader wire definitions.

pub mod constants;
pub mod diagnostics;
pub mod frame;
pub mod message;
pub mod status;

pub use constants::*;
pub use diagnostics::{DeviceError, describe};
pub use frame::{FrameAssembler, FrameError, decode, encode, parse_hex};
pub use message::{CanMessage, MessageKind};
pub use status::{BootloaderStatus, describe_status};
