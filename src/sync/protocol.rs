//! Binary WebSocket protocol for canvas synchronization.
//!
//! Frame layout: one version byte, one message-type byte, a u24 payload
//! length, then a bincode-encoded payload. JSON text frames are also
//! accepted by the server for debugging.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::grid::{Color, Coord};
use super::{ClientId, SessionId};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB). Also the ceiling the u24 length field can
/// express, so nothing on the wire may exceed it.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// How many pixels go into one `Init` frame. A full snapshot of a dense
/// canvas can exceed [`MAX_MESSAGE_SIZE`], so it is split into chunks and
/// the last one carries `done: true`. Each entry is 8 coordinate bytes plus
/// a length-prefixed 7-byte color string, roughly 23 bytes, which keeps a
/// chunk comfortably inside the cap.
pub const SNAPSHOT_CHUNK_PIXELS: usize = 250_000;

/// Message type identifiers for binary encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Canvas
    Init = 0x10,
    Pixel = 0x11,

    // Chat & presence
    Chat = 0x20,
    UserJoined = 0x21,
    UserLeft = 0x22,
    OnlineCount = 0x23,

    // Keepalive & debug
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::Init),
            0x11 => Ok(MessageType::Pixel),
            0x20 => Ok(MessageType::Chat),
            0x21 => Ok(MessageType::UserJoined),
            0x22 => Ok(MessageType::UserLeft),
            0x23 => Ok(MessageType::OnlineCount),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// A chat message, echoed verbatim to all connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: ClientId,
    pub username: String,
    pub message: String,
    /// Client-side timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// Language preference label, e.g. "en".
    pub language: String,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake with client info.
    Hello {
        protocol_version: u8,
        /// Stable per-client identifier, persisted client-side.
        client_id: Option<ClientId>,
        username: Option<String>,
    },

    /// One edit: set a pixel, or erase it when `color` is `None`.
    Pixel {
        x: u32,
        y: u32,
        color: Option<Color>,
    },

    /// Chat message; the first one also registers the display name.
    Chat(ChatMessage),

    /// Keepalive.
    Ping { timestamp: u64 },

    /// Graceful disconnect.
    Goodbye { reason: Option<String> },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Welcome response with the assigned session id.
    Welcome {
        protocol_version: u8,
        session_id: SessionId,
        server_time: i64,
    },

    /// One chunk of the full snapshot sent on join, the only resync
    /// mechanism. `done` marks the final chunk; the client applies the
    /// accumulated snapshot only then.
    Init {
        pixels: Vec<(Coord, Color)>,
        done: bool,
    },

    /// One edit, rebroadcast to every other active connection.
    Pixel {
        x: u32,
        y: u32,
        color: Option<Color>,
    },

    /// Chat broadcast, echoed to all including the sender.
    Chat(ChatMessage),

    /// Presence notice: a display name was seen for the first time.
    UserJoined { username: String },

    /// Presence notice: a named user disconnected.
    UserLeft { username: String },

    /// Live connected-count broadcast.
    OnlineCount { count: usize },

    /// Error response.
    Error {
        code: ErrorCode,
        message: String,
        /// Set for `RateLimited`: how long until the next edit is allowed.
        retry_after_ms: Option<u64>,
    },

    /// Keepalive response.
    Pong { timestamp: u64, server_time: i64 },
}

/// Error codes for server responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    OutOfBounds = 2,
    InvalidColor = 3,
    RateLimited = 4,
    ServerError = 5,
    VersionMismatch = 6,
}

/// Protocol codec for encoding/decoding messages.
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes.
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Pixel { .. } => MessageType::Pixel,
            ClientMessage::Chat(_) => MessageType::Chat,
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
        };
        encode(msg_type, msg)
    }

    /// Encode a server message to bytes.
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Init { .. } => MessageType::Init,
            ServerMessage::Pixel { .. } => MessageType::Pixel,
            ServerMessage::Chat(_) => MessageType::Chat,
            ServerMessage::UserJoined { .. } => MessageType::UserJoined,
            ServerMessage::UserLeft { .. } => MessageType::UserLeft,
            ServerMessage::OnlineCount { .. } => MessageType::OnlineCount,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Pong { .. } => MessageType::Pong,
        };
        encode(msg_type, msg)
    }

    /// Decode a client message from bytes.
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        decode(data)
    }

    /// Decode a server message from bytes.
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        decode(data)
    }
}

fn encode<T: Serialize>(msg_type: MessageType, msg: &T) -> Result<Bytes, ProtocolError> {
    let payload = bincode::serialize(msg)?;

    if payload.len() + 5 > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + 5,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < 5 {
        return Err(ProtocolError::InvalidFormat("message too short".to_string()));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    // Validate the type byte even though the payload tag is authoritative
    let msg_type = cursor.get_u8();
    MessageType::try_from(msg_type)?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < 5 + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "expected {} bytes, got {}",
            5 + payload_len,
            data.len()
        )));
    }

    let payload = &data[5..5 + payload_len];
    Ok(bincode::deserialize(payload)?)
}

/// Extension trait for writing u24 values.
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
