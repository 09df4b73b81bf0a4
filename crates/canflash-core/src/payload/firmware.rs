//! Firmware image loading and chunking.
//!
//! The image is sent as a series of data frames, each carrying one sequence
//! byte followed by up to 7 firmware bytes. The sequence byte is the chunk
//! index modulo 256.

use std::path::Path;

use thiserror::Error;

use crate::protocol::constants::CHUNK_DATA_LEN;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Firmware image is empty")]
    Empty,
    #[error("Firmware too large: {actual} bytes, maximum {maximum}")]
    TooLarge { actual: usize, maximum: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw firmware blob with its CRC32.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    crc32: u32,
}

impl FirmwareImage {
    /// Wrap raw bytes. The size must be non-zero and fit a u32.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, FirmwareError> {
        Self::with_limit(data, u32::MAX as usize)
    }

    /// Wrap raw bytes, rejecting images above `maximum` bytes.
    pub fn with_limit(data: Vec<u8>, maximum: usize) -> Result<Self, FirmwareError> {
        if data.is_empty() {
            return Err(FirmwareError::Empty);
        }
        let maximum = maximum.min(u32::MAX as usize);
        if data.len() > maximum {
            return Err(FirmwareError::TooLarge {
                actual: data.len(),
                maximum,
            });
        }
        let crc32 = crc32_ieee(&data);
        Ok(Self { data, crc32 })
    }

    /// Load an image from disk.
    pub fn load<P: AsRef<Path>>(path: P, maximum: usize) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path)?;
        Self::with_limit(data, maximum)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Number of data frames needed: `ceil(len / 7)`.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(CHUNK_DATA_LEN)
    }

    /// Firmware bytes of chunk `index`, without the sequence byte.
    pub fn chunk_data(&self, index: usize) -> &[u8] {
        let start = index * CHUNK_DATA_LEN;
        if start >= self.data.len() {
            return &[];
        }
        let end = (start + CHUNK_DATA_LEN).min(self.data.len());
        &self.data[start..end]
    }

    /// Data frame payload for chunk `index`: sequence byte + data.
    pub fn chunk_payload(&self, index: usize) -> Vec<u8> {
        let data = self.chunk_data(index);
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(sequence_for(index));
        payload.extend_from_slice(data);
        payload
    }

    pub fn chunks(&self) -> ChunkIterator<'_> {
        ChunkIterator {
            image: self,
            index: 0,
        }
    }
}

/// Sequence byte of chunk `index`.
pub fn sequence_for(index: usize) -> u8 {
    (index % 256) as u8
}

/// One sequence-numbered slice of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub sequence: u8,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.data.len() + 1);
        payload.push(self.sequence);
        payload.extend_from_slice(self.data);
        payload
    }
}

/// Iterator over 7-byte chunks.
#[derive(Debug)]
pub struct ChunkIterator<'a> {
    image: &'a FirmwareImage,
    index: usize,
}

impl<'a> Iterator for ChunkIterator<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.image.chunk_count() {
            return None;
        }
        let chunk = Chunk {
            index: self.index,
            sequence: sequence_for(self.index),
            data: self.image.chunk_data(self.index),
        };
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.image.chunk_count() - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIterator<'_> {}

/// CRC-32/IEEE (reflected, poly 0xEDB88320).
pub fn crc32_ieee(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in bytes {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = 0u32.wrapping_sub(crc & 1);
            crc = (crc >> 1) ^ (0xEDB8_8320u32 & mask);
        }
    }
    !crc
}
