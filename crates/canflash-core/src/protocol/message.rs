//! Logical CAN messages and the identifier table.

use std::fmt;

use super::constants::*;

/// A logical message: 11-bit identifier plus up to 8 payload bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanMessage {
    id: u16,
    data: [u8; MAX_PAYLOAD_LEN],
    len: u8,
}

impl CanMessage {
    /// Build a message, truncating the payload to 8 bytes.
    pub fn from_parts(id: u16, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_PAYLOAD_LEN);
        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            data,
            len: len as u8,
        }
    }

    /// Message with no payload.
    pub fn empty(id: u16) -> Self {
        Self::from_parts(id, &[])
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_id(self.id)
    }
}

impl fmt::Debug for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanMessage(0x{:03X} [", self.id)?;
        for (i, b) in self.payload().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "])")
    }
}

/// Every identifier the bootloader protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    EnterBootloader,
    QueryInfo,
    Ping,
    BeginUpdate,
    Data,
    EndUpdate,
    Reset,
    PingResponse,
    BeginResponse,
    Progress,
    EndResponse,
    QueryResponse,
    SequenceMismatch,
    SizeMismatch,
    FlashWriteError,
    ValidationError,
    BufferOverflow,
}

impl MessageKind {
    pub const ALL: [MessageKind; 17] = [
        MessageKind::EnterBootloader,
        MessageKind::QueryInfo,
        MessageKind::Ping,
        MessageKind::BeginUpdate,
        MessageKind::Data,
        MessageKind::EndUpdate,
        MessageKind::Reset,
        MessageKind::PingResponse,
        MessageKind::BeginResponse,
        MessageKind::Progress,
        MessageKind::EndResponse,
        MessageKind::QueryResponse,
        MessageKind::SequenceMismatch,
        MessageKind::SizeMismatch,
        MessageKind::FlashWriteError,
        MessageKind::ValidationError,
        MessageKind::BufferOverflow,
    ];

    /// Identifiers of every device-originated error report.
    pub const ERROR_IDS: [u16; 5] = [
        ERR_SEQUENCE_MISMATCH,
        ERR_SIZE_MISMATCH,
        ERR_FLASH_WRITE,
        ERR_VALIDATION,
        ERR_BUFFER_OVERFLOW,
    ];

    pub const fn id(self) -> u16 {
        match self {
            MessageKind::EnterBootloader => CMD_ENTER_BOOTLOADER,
            MessageKind::QueryInfo => CMD_QUERY_INFO,
            MessageKind::Ping => CMD_PING,
            MessageKind::BeginUpdate => CMD_BEGIN_UPDATE,
            MessageKind::Data => CMD_DATA,
            MessageKind::EndUpdate => CMD_END_UPDATE,
            MessageKind::Reset => CMD_RESET,
            MessageKind::PingResponse => RSP_PING,
            MessageKind::BeginResponse => RSP_BEGIN,
            MessageKind::Progress => RSP_PROGRESS,
            MessageKind::EndResponse => RSP_END,
            MessageKind::QueryResponse => RSP_QUERY,
            MessageKind::SequenceMismatch => ERR_SEQUENCE_MISMATCH,
            MessageKind::SizeMismatch => ERR_SIZE_MISMATCH,
            MessageKind::FlashWriteError => ERR_FLASH_WRITE,
            MessageKind::ValidationError => ERR_VALIDATION,
            MessageKind::BufferOverflow => ERR_BUFFER_OVERFLOW,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    /// Device-reported failure.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            MessageKind::SequenceMismatch
                | MessageKind::SizeMismatch
                | MessageKind::FlashWriteError
                | MessageKind::ValidationError
                | MessageKind::BufferOverflow
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::EnterBootloader => write!(f, "ENTER_BOOTLOADER"),
            MessageKind::QueryInfo => write!(f, "QUERY_INFO"),
            MessageKind::Ping => write!(f, "PING"),
            MessageKind::BeginUpdate => write!(f, "BEGIN_UPDATE"),
            MessageKind::Data => write!(f, "DATA"),
            MessageKind::EndUpdate => write!(f, "END_UPDATE"),
            MessageKind::Reset => write!(f, "RESET"),
            MessageKind::PingResponse => write!(f, "PING_RSP"),
            MessageKind::BeginResponse => write!(f, "BEGIN_RSP"),
            MessageKind::Progress => write!(f, "PROGRESS"),
            MessageKind::EndResponse => write!(f, "END_RSP"),
            MessageKind::QueryResponse => write!(f, "QUERY_RSP"),
            MessageKind::SequenceMismatch => write!(f, "ERR_SEQUENCE"),
            MessageKind::SizeMismatch => write!(f, "ERR_SIZE"),
            MessageKind::FlashWriteError => write!(f, "ERR_FLASH"),
            MessageKind::ValidationError => write!(f, "ERR_VALIDATION"),
            MessageKind::BufferOverflow => write!(f, "ERR_OVERFLOW"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identifiers_distinct_and_11_bit() {
        let ids: HashSet<u16> = MessageKind::ALL.iter().map(|k| k.id()).collect();
        assert_eq!(ids.len(), MessageKind::ALL.len());
        assert!(ids.iter().all(|&id| id <= MAX_IDENTIFIER));
    }

    #[test]
    fn test_from_id_covers_every_kind() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(MessageKind::from_id(0x123), None);
    }

    #[test]
    fn test_error_ids_match_error_kinds() {
        let errors: Vec<u16> = MessageKind::ALL
            .iter()
            .filter(|k| k.is_error())
            .map(|k| k.id())
            .collect();
        assert_eq!(errors, MessageKind::ERROR_IDS.to_vec());
    }

    #[test]
    fn test_message_truncates_payload() {
        let msg = CanMessage::from_parts(CMD_DATA, &[0; 12]);
        assert_eq!(msg.payload().len(), 8);
        assert_eq!(format!("{:?}", CanMessage::from_parts(0x781, &[1, 0xAB])), "CanMessage(0x781 [01 AB])");
    }
}
