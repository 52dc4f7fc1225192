//! Wire protocol for document synchronization.
//!
//! Messages travel either as binary frames (version byte, type byte, 24-bit
//! payload length, bincode payload) or as JSON text frames for browser
//! clients. Both carry the same [`ClientMessage`] / [`ServerMessage`] enums.
//! Patches are carried in their textual form (see [`crate::sync::patch`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::{ClientId, DocumentId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Welcome = 0x02,
    Error = 0x04,

    // Rooms
    Join = 0x20,
    Leave = 0x21,
    Snapshot = 0x22,
    Left = 0x23,
    MembershipChanged = 0x24,

    // Patches
    SubmitPatch = 0x30,
    PatchBroadcast = 0x31,
    PatchAccepted = 0x32,
    SnapshotRequest = 0x33,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x02 => Ok(MessageType::Welcome),
            0x04 => Ok(MessageType::Error),
            0x20 => Ok(MessageType::Join),
            0x21 => Ok(MessageType::Leave),
            0x22 => Ok(MessageType::Snapshot),
            0x23 => Ok(MessageType::Left),
            0x24 => Ok(MessageType::MembershipChanged),
            0x30 => Ok(MessageType::SubmitPatch),
            0x31 => Ok(MessageType::PatchBroadcast),
            0x32 => Ok(MessageType::PatchAccepted),
            0x33 => Ok(MessageType::SnapshotRequest),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a document; answered with a snapshot
    Join { document_id: DocumentId },

    /// Unsubscribe from a document
    Leave { document_id: DocumentId },

    /// Apply a patch to a document
    SubmitPatch {
        document_id: DocumentId,
        /// Patch in text form
        patch: String,
        /// Version the patch was computed against, if the client tracks it
        #[serde(default)]
        base_version: Option<u64>,
    },

    /// Ask for the current content again
    RequestSnapshot { document_id: DocumentId },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once per connection
    Welcome {
        protocol_version: u8,
        client_id: ClientId,
        server_time: i64,
    },

    /// Error response, only ever sent to the client that caused it
    Error {
        code: ErrorCode,
        message: String,
        document_id: Option<DocumentId>,
    },

    /// Full document content
    Snapshot {
        document_id: DocumentId,
        content: String,
        version: u64,
    },

    /// Someone joined or left a room the recipient is in
    MembershipChanged {
        document_id: DocumentId,
        client_id: ClientId,
        change: MembershipChange,
        member_count: usize,
    },

    /// Confirmation of leaving a document
    Left { document_id: DocumentId },

    /// A patch another client applied
    PatchBroadcast {
        document_id: DocumentId,
        patch: String,
        from_client: ClientId,
        /// Document version after the patch
        version: u64,
    },

    /// The sender's own patch was applied
    PatchAccepted { document_id: DocumentId, version: u64 },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },
}

impl ServerMessage {
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        document_id: Option<DocumentId>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            document_id,
        }
    }

    fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Snapshot { .. } => MessageType::Snapshot,
            ServerMessage::MembershipChanged { .. } => MessageType::MembershipChanged,
            ServerMessage::Left { .. } => MessageType::Left,
            ServerMessage::PatchBroadcast { .. } => MessageType::PatchBroadcast,
            ServerMessage::PatchAccepted { .. } => MessageType::PatchAccepted,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

impl ClientMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Join { .. } => MessageType::Join,
            ClientMessage::Leave { .. } => MessageType::Leave,
            ClientMessage::SubmitPatch { .. } => MessageType::SubmitPatch,
            ClientMessage::RequestSnapshot { .. } => MessageType::SnapshotRequest,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }

    /// Document the message refers to, if any
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { document_id }
            | ClientMessage::Leave { document_id }
            | ClientMessage::SubmitPatch { document_id, .. }
            | ClientMessage::RequestSnapshot { document_id } => Some(document_id),
            ClientMessage::Ping { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Joined,
    Left,
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ErrorCode {
    NotFound = 1,
    AlreadyExists = 2,
    InvalidInput = 3,
    PatchConflict = 4,
    ServerError = 5,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to a binary frame
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        frame(msg.message_type(), msg)
    }

    /// Encode a server message to a binary frame
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        frame(msg.message_type(), msg)
    }

    /// Decode a client message from a binary frame
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, msg): (_, ClientMessage) = unframe(data)?;
        if msg.message_type() != msg_type {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header says {:?}, payload is {:?}",
                msg_type,
                msg.message_type()
            )));
        }
        Ok(msg)
    }

    /// Decode a server message from a binary frame
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (_, msg) = unframe(data)?;
        Ok(msg)
    }

    /// Decode a client message from a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a server message as a JSON text frame
    pub fn encode_server_json(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }
}

fn frame<T: Serialize>(msg_type: MessageType, msg: &T) -> Result<Bytes, ProtocolError> {
    let payload = bincode::serialize(msg)?;

    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

fn unframe<T: DeserializeOwned>(data: &[u8]) -> Result<(MessageType, T), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat(
            "Message too short".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
    Ok((msg_type, bincode::deserialize(payload)?))
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
