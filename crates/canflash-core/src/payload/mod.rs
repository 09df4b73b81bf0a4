//! Payload handling module.
//!
//! Provides loading and chunking for firmware images.

pub mod firmware;

pub use firmware::{Chunk, ChunkIterator, FirmwareError, FirmwareImage, crc32_ieee, sequence_for};
