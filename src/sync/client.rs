//! Client sync agent: the per-connection logic that keeps a local mirror of
//! the canvas converged with the server.
//!
//! The agent connects over WebSocket, accumulates the chunked `Init`
//! snapshot and replaces its mirror wholesale once the final chunk lands,
//! applies remote edits with the same set/erase semantics as the server,
//! and emits events for the presentation layer to react to.
//! Outgoing edits pass through an advisory cooldown gate and are applied to
//! the mirror optimistically on submission; the server never echoes an edit
//! back to its sender.

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use serde::{Deserialize, Serialize};

use super::grid::{Color, Coord, Edit, GridState};
use super::protocol::{
    ChatMessage, ClientMessage, ErrorCode, ProtocolError, ServerMessage, SyncProtocol,
    PROTOCOL_VERSION,
};
use super::SessionId;

/// How long the stable client id and language preference are retained.
const PROFILE_RETENTION_MS: i64 = 365 * 24 * 60 * 60 * 1000;
/// How long the last-accepted-edit timestamp is retained.
const LAST_EDIT_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Errors surfaced by the sync agent.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("edit cooldown active, retry in {0:?}")]
    Cooldown(Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Events emitted by the sync agent for the presentation layer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Handshake completed; the server assigned this session id.
    Connected { session_id: SessionId },
    /// Full snapshot received and applied to the mirror.
    SnapshotApplied { pixels: usize },
    /// A remote edit was applied to the mirror.
    RemotePixel {
        x: u32,
        y: u32,
        color: Option<Color>,
    },
    /// Chat broadcast (includes our own messages, echoed by the server).
    Chat(ChatMessage),
    /// Presence notices.
    UserJoined { username: String },
    UserLeft { username: String },
    /// Live connected-count update.
    OnlineCount { count: usize },
    /// The server rejected something.
    ServerError {
        code: ErrorCode,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// Connection lost; reconnecting yields a fresh full snapshot.
    Disconnected,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Durable client-local record: stable identifier, language preference and
/// last-accepted-edit timestamp, each with its own retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_id: String,
    client_id_saved_at: i64,
    pub language: String,
    language_saved_at: i64,
    last_edit_at: Option<i64>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl ClientProfile {
    /// Fresh profile with a new random 6-digit identifier.
    pub fn generate() -> Self {
        let now = now_ms();
        Self {
            client_id: format!("{:06}", rand::random::<u32>() % 1_000_000),
            client_id_saved_at: now,
            language: "en".to_string(),
            language_saved_at: now,
            last_edit_at: None,
            path: None,
        }
    }

    /// Load from a file, regenerating on missing/corrupt data and dropping
    /// expired fields. Mirrors the store's recoverable-at-start rule.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut profile = match std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Self>(&raw).ok())
        {
            Some(profile) => profile,
            None => {
                debug!(path = %path.display(), "no client profile, generating");
                Self::generate()
            }
        };
        profile.path = Some(path.to_path_buf());
        profile.expire(now_ms());
        profile
    }

    fn expire(&mut self, now: i64) {
        if now - self.client_id_saved_at > PROFILE_RETENTION_MS {
            *self = Self {
                path: self.path.clone(),
                ..Self::generate()
            };
            return;
        }
        if now - self.language_saved_at > PROFILE_RETENTION_MS {
            self.language = "en".to_string();
            self.language_saved_at = now;
        }
        if let Some(last) = self.last_edit_at {
            if now - last > LAST_EDIT_RETENTION_MS {
                self.last_edit_at = None;
            }
        }
    }

    /// Persist the profile; failures are non-fatal.
    pub fn save(&self) {
        let Some(path) = &self.path else { return };
        let result = serde_json::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(path, json)
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to save client profile");
        }
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.language = language.into();
        self.language_saved_at = now_ms();
    }

    pub fn record_edit(&mut self) {
        self.last_edit_at = Some(now_ms());
    }

    pub fn last_edit_at(&self) -> Option<i64> {
        self.last_edit_at
    }

    /// Display name derived from the stable id, as the reference UI does.
    pub fn username(&self) -> String {
        format!("User{}", self.client_id)
    }
}

/// Advisory client-side edit gate.
///
/// Stamped optimistically the instant an edit is sent, not when the server
/// confirms it. The server enforces its own gate independently.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: Duration,
    last_sent_ms: Option<i64>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent_ms: None,
        }
    }

    /// Seed from a persisted timestamp so the window survives restarts.
    pub fn seeded(cooldown: Duration, last_edit_ms: Option<i64>) -> Self {
        Self {
            cooldown,
            last_sent_ms: last_edit_ms,
        }
    }

    /// Remaining wait, if still inside the window. Drives the countdown UI.
    pub fn remaining(&self) -> Option<Duration> {
        let last = self.last_sent_ms?;
        let elapsed = now_ms().saturating_sub(last);
        let cooldown_ms = self.cooldown.as_millis() as i64;
        if elapsed < cooldown_ms {
            Some(Duration::from_millis((cooldown_ms - elapsed) as u64))
        } else {
            None
        }
    }

    pub fn check(&self) -> Result<(), Duration> {
        match self.remaining() {
            Some(remaining) => Err(remaining),
            None => Ok(()),
        }
    }

    pub fn stamp(&mut self) {
        self.last_sent_ms = Some(now_ms());
    }
}

/// WebSocket sync agent holding the local canvas mirror.
pub struct SyncClient {
    mirror: Arc<RwLock<GridState>>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    gate: CooldownGate,
    profile: ClientProfile,
}

impl SyncClient {
    /// Connect, send the handshake and spawn the reader/writer tasks.
    pub async fn connect(
        url: &str,
        profile: ClientProfile,
        cooldown: Duration,
    ) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(url).await?;
        let (mut ws_sink, mut ws_stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let hello = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: Some(profile.client_id.clone()),
            username: None,
        };
        out_tx
            .send(WsMessage::Binary(
                SyncProtocol::encode_client(&hello)?.to_vec(),
            ))
            .map_err(|_| ClientError::ConnectionClosed)?;

        let mirror = Arc::new(RwLock::new(GridState::new()));
        let (event_tx, events) = mpsc::unbounded_channel();

        let reader_mirror = mirror.clone();
        tokio::spawn(async move {
            // Snapshot chunks accumulate here until the final one arrives
            let mut pending_snapshot: Vec<(Coord, Color)> = Vec::new();
            while let Some(Ok(msg)) = ws_stream.next().await {
                let data = match msg {
                    WsMessage::Binary(data) => data,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                match SyncProtocol::decode_server(&data) {
                    Ok(server_msg) => {
                        if handle_server_message(
                            server_msg,
                            &reader_mirror,
                            &event_tx,
                            &mut pending_snapshot,
                        )
                        .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to decode server message"),
                }
            }
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        let gate = CooldownGate::seeded(cooldown, profile.last_edit_at());

        Ok(Self {
            mirror,
            events,
            outbound: out_tx,
            gate,
            profile,
        })
    }

    /// Next event from the server, `None` once disconnected and drained.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Shared handle to the local mirror for rendering.
    pub fn mirror(&self) -> Arc<RwLock<GridState>> {
        self.mirror.clone()
    }

    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    /// Remaining cooldown, if any, for the countdown UI.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.gate.remaining()
    }

    /// Submit one edit: gate, apply optimistically, send, stamp.
    pub fn send_pixel(&mut self, x: u32, y: u32, color: Option<Color>) -> Result<(), ClientError> {
        self.gate.check().map_err(ClientError::Cooldown)?;

        let frame = SyncProtocol::encode_client(&ClientMessage::Pixel { x, y, color })?;

        self.mirror.write().apply(&Edit { x, y, color });
        self.outbound
            .send(WsMessage::Binary(frame.to_vec()))
            .map_err(|_| ClientError::ConnectionClosed)?;

        self.gate.stamp();
        self.profile.record_edit();
        self.profile.save();
        Ok(())
    }

    /// Send a chat message built from the profile identity.
    pub fn send_chat(&self, message: impl Into<String>) -> Result<(), ClientError> {
        let chat = ChatMessage {
            user_id: self.profile.client_id.clone(),
            username: self.profile.username(),
            message: message.into(),
            timestamp: now_ms(),
            language: self.profile.language.clone(),
        };
        let frame = SyncProtocol::encode_client(&ClientMessage::Chat(chat))?;
        self.outbound
            .send(WsMessage::Binary(frame.to_vec()))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Graceful disconnect.
    pub fn goodbye(&self) {
        if let Ok(frame) = SyncProtocol::encode_client(&ClientMessage::Goodbye { reason: None }) {
            let _ = self.outbound.send(WsMessage::Binary(frame.to_vec()));
        }
        let _ = self.outbound.send(WsMessage::Close(None));
    }
}

fn handle_server_message(
    msg: ServerMessage,
    mirror: &Arc<RwLock<GridState>>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    pending_snapshot: &mut Vec<(Coord, Color)>,
) -> Result<(), ()> {
    let event = match msg {
        ServerMessage::Welcome { session_id, .. } => SyncEvent::Connected { session_id },
        ServerMessage::Init { pixels, done } => {
            pending_snapshot.extend(pixels);
            if !done {
                return Ok(());
            }
            let count = pending_snapshot.len();
            *mirror.write() = GridState::from_snapshot(pending_snapshot.drain(..));
            SyncEvent::SnapshotApplied { pixels: count }
        }
        ServerMessage::Pixel { x, y, color } => {
            mirror.write().apply(&Edit { x, y, color });
            SyncEvent::RemotePixel { x, y, color }
        }
        ServerMessage::Chat(chat) => SyncEvent::Chat(chat),
        ServerMessage::UserJoined { username } => SyncEvent::UserJoined { username },
        ServerMessage::UserLeft { username } => SyncEvent::UserLeft { username },
        ServerMessage::OnlineCount { count } => SyncEvent::OnlineCount { count },
        ServerMessage::Error {
            code,
            message,
            retry_after_ms,
        } => SyncEvent::ServerError {
            code,
            message,
            retry_after_ms,
        },
        ServerMessage::Pong { .. } => return Ok(()),
    };
    events.send(event).map_err(|_| ())
}
