//! Session configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::DEFAULT_CHUNK_RETRIES;
use crate::transport::serial::DEFAULT_BAUD_RATE;

/// Configuration for an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial port of the CAN adapter.
    pub port: Option<String>,
    /// Adapter baud rate.
    pub baud_rate: u32,
    /// Wait after "enter bootloader" before talking to the bootloader.
    pub enter_delay_ms: u64,
    /// Query-info response timeout.
    pub query_timeout_ms: u64,
    /// Ping response timeout.
    pub ping_timeout_ms: u64,
    /// Begin-update response timeout (the device erases flash here).
    pub begin_timeout_ms: u64,
    /// Per-chunk acknowledgement timeout.
    pub chunk_timeout_ms: u64,
    /// End-update response timeout (the device verifies the image here).
    pub end_timeout_ms: u64,
    /// Sequence-mismatch resends allowed per chunk.
    pub max_chunk_retries: u8,
    /// Granularity of cancellation checks while waiting.
    pub poll_interval_ms: u64,
    /// Largest image accepted, in bytes.
    pub max_firmware_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            enter_delay_ms: 500,
            query_timeout_ms: 2000,
            ping_timeout_ms: 1000,
            begin_timeout_ms: 10_000,
            chunk_timeout_ms: 1000,
            end_timeout_ms: 5000,
            max_chunk_retries: DEFAULT_CHUNK_RETRIES,
            poll_interval_ms: 20,
            max_firmware_size: 512 * 1024,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn enter_delay(&self) -> Duration {
        Duration::from_millis(self.enter_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_roundtrip() {
        let config = SessionConfig {
            port: Some("/dev/ttyUSB0".to_string()),
            max_chunk_retries: 5,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: SessionConfig = toml::from_str("chunk_timeout_ms = 250\n").unwrap();
        assert_eq!(parsed.chunk_timeout_ms, 250);
        assert_eq!(parsed.max_chunk_retries, DEFAULT_CHUNK_RETRIES);
        assert_eq!(parsed.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("canflash-config-{}.toml", std::process::id()));
        let config = SessionConfig::default();
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
        std::fs::remove_file(&path).ok();
    }
}
