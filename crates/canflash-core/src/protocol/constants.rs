//! Protocol constants for the instrument bootloader.
//!
//! Identifiers are 11-bit CAN identifiers shared with the device firmware.
//! They are part of the wire contract and must not be renumbered.

// ============================================================================
// Physical Frame Layout
// ============================================================================

/// Start-of-frame marker (byte 0).
pub const FRAME_START: u8 = 0xAA;

/// End-of-frame marker (byte 12 in the canonical frame).
pub const FRAME_END: u8 = 0x55;

/// Fixed high bits of the header byte; the low nibble carries the payload length.
pub const FRAME_HEADER_BASE: u8 = 0xC0;

/// Mask selecting the payload length from the header byte.
pub const FRAME_LEN_MASK: u8 = 0x0F;

/// Offset of the little-endian identifier.
pub const FRAME_ID_OFFSET: usize = 2;

/// Offset of the first payload byte.
pub const FRAME_DATA_OFFSET: usize = 4;

/// Header and payload block size (start, header, id, 8 data bytes).
pub const FRAME_BLOCK_LEN: usize = 12;

/// Canonical on-wire frame length, including reserved trailing bytes.
pub const FRAME_LEN: usize = 20;

/// Shortest buffer the decoder accepts.
pub const FRAME_MIN_DECODE_LEN: usize = 18;

/// Largest valid 11-bit identifier.
pub const MAX_IDENTIFIER: u16 = 0x7FF;

/// Maximum CAN payload length.
pub const MAX_PAYLOAD_LEN: usize = 8;

// ============================================================================
// Host -> Device Commands
// ============================================================================

/// Switch from the application into the bootloader (no payload).
pub const CMD_ENTER_BOOTLOADER: u16 = 0x7F0;

/// Request bank and bootloader information (no payload).
pub const CMD_QUERY_INFO: u16 = 0x7F1;

/// Liveness check, answered with [`RSP_PING`].
pub const CMD_PING: u16 = 0x7F2;

/// Start an update; payload is the firmware size (u32 LE).
pub const CMD_BEGIN_UPDATE: u16 = 0x7F3;

/// Firmware data frame: 1 sequence byte + up to 7 data bytes.
pub const CMD_DATA: u16 = 0x7F4;

/// Finish an update; payload is the CRC32 of the whole image (u32 LE).
pub const CMD_END_UPDATE: u16 = 0x7F5;

/// Reset the device (no payload).
pub const CMD_RESET: u16 = 0x7F6;

// ============================================================================
// Device -> Host Responses
// ============================================================================

/// `[status]`
pub const RSP_PING: u16 = 0x781;

/// `[status, target_bank]`
pub const RSP_BEGIN: u16 = 0x782;

/// `[acked_sequence, bytes_received u32 LE]`
pub const RSP_PROGRESS: u16 = 0x783;

/// `[status, bank, crc32 u32 LE]`
pub const RSP_END: u16 = 0x784;

/// `[selector, ...]`, see [`crate::bank`].
pub const RSP_QUERY: u16 = 0x785;

// ============================================================================
// Device -> Host Error Reports
// ============================================================================

/// `[expected, received]`, retryable.
pub const ERR_SEQUENCE_MISMATCH: u16 = 0x790;

/// `[expected u32 LE, received u32 LE]`
pub const ERR_SIZE_MISMATCH: u16 = 0x791;

/// `[address u32 LE]` or `['E', address u32 LE]` for erase failures.
pub const ERR_FLASH_WRITE: u16 = 0x792;

/// `[stack_pointer u32 LE, reset_vector u32 LE]`
pub const ERR_VALIDATION: u16 = 0x793;

/// No payload.
pub const ERR_BUFFER_OVERFLOW: u16 = 0x794;

/// Marker byte distinguishing a flash erase failure from a write failure.
pub const FLASH_ERASE_MARKER: u8 = b'E';

// ============================================================================
// Transfer
// ============================================================================

/// Data bytes carried by one data frame (the first byte is the sequence).
pub const CHUNK_DATA_LEN: usize = MAX_PAYLOAD_LEN - 1;

/// Default bound on sequence-mismatch resends of a single chunk.
pub const DEFAULT_CHUNK_RETRIES: u8 = 3;

/// Number of firmware banks on the device.
pub const BANK_COUNT: usize = 2;
