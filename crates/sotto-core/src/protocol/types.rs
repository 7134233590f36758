//! Message types and the file metadata model.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Message type byte carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Peer's declared nickname (encrypted).
    Nickname = 0x00,
    /// Chat text (encrypted).
    Text = 0x01,
    /// File offer carrying JSON metadata (encrypted).
    FileOffer = 0x02,
    /// Acceptance of a pending offer (encrypted).
    FileAccept = 0x03,
    /// Rejection of a pending offer (encrypted).
    FileReject = 0x04,
    /// One chunk of file content (encrypted).
    FileChunk = 0x05,
    /// End of file content (encrypted).
    FileDone = 0x06,
    /// Raw 32-byte public key. The only unencrypted payload.
    KeyExchange = 0x0A,
}

impl MessageType {
    /// Parse a message type from its wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Nickname),
            0x01 => Ok(Self::Text),
            0x02 => Ok(Self::FileOffer),
            0x03 => Ok(Self::FileAccept),
            0x04 => Ok(Self::FileReject),
            0x05 => Ok(Self::FileChunk),
            0x06 => Ok(Self::FileDone),
            0x0A => Ok(Self::KeyExchange),
            _ => Err(Error::Protocol(format!("unknown message type: {byte:#04x}"))),
        }
    }

    /// Convert to the wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Metadata sent ahead of file content, JSON-encoded inside an encrypted
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Base name of the offered file.
    #[serde(rename = "fileName")]
    pub file_name: String,

    /// File size in bytes.
    #[serde(rename = "fileSize")]
    pub file_size: i64,

    /// Sender-side absolute path, used to reopen the file once the offer is
    /// accepted. Never acted on by the receiver.
    #[serde(rename = "originalPath", skip_serializing_if = "Option::is_none", default)]
    pub original_path: Option<String>,

    /// Offering member's id in multi-party sessions.
    #[serde(rename = "senderID", skip_serializing_if = "Option::is_none", default)]
    pub sender_id: Option<String>,
}

impl FileMetadata {
    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("encode metadata: {e}")))
    }

    /// Deserialize from the JSON wire form.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Protocol(format!("decode metadata: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for mt in [
            MessageType::Nickname,
            MessageType::Text,
            MessageType::FileOffer,
            MessageType::FileAccept,
            MessageType::FileReject,
            MessageType::FileChunk,
            MessageType::FileDone,
            MessageType::KeyExchange,
        ] {
            assert_eq!(MessageType::from_byte(mt.to_byte()).expect("parse"), mt);
        }
    }

    #[test]
    fn test_unknown_message_type() {
        assert!(MessageType::from_byte(0x07).is_err());
        assert!(MessageType::from_byte(0xFF).is_err());
    }

    #[test]
    fn test_metadata_wire_field_names() {
        let meta = FileMetadata {
            file_name: "notes.txt".into(),
            file_size: 1234,
            original_path: None,
            sender_id: None,
        };
        let json = String::from_utf8(meta.to_json().expect("encode")).expect("utf8");
        assert!(json.contains("\"fileName\""));
        assert!(json.contains("\"fileSize\""));
        assert!(!json.contains("originalPath"));
        assert!(!json.contains("senderID"));
    }

    #[test]
    fn test_metadata_roundtrip_with_optionals() {
        let meta = FileMetadata {
            file_name: "a.bin".into(),
            file_size: 9,
            original_path: Some("/home/u/a.bin".into()),
            sender_id: Some("client-1".into()),
        };
        let parsed = FileMetadata::from_json(&meta.to_json().expect("encode")).expect("decode");
        assert_eq!(parsed, meta);
    }
}
