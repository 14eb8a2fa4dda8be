//! SyncServer implementation for the shared pixel canvas.
//!
//! The server owns the authoritative grid behind a single mutex: validate,
//! mutate, persist and broadcast for one edit all happen under that lock,
//! so edits are applied in arrival order and a half-applied edit can never
//! interleave with a broadcast or a join snapshot. Broadcast delivery is
//! fire-and-forget over per-session channels; a disconnected client simply
//! gets a full snapshot on reconnect.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::grid::{Color, Edit, GridState};
use super::limiter::EditGate;
use super::protocol::{ChatMessage, ServerMessage, SNAPSHOT_CHUNK_PIXELS};
use super::{SessionId, SyncError, SyncResult};
use crate::storage::{CanvasStore, PersistPolicy};

/// Configuration for the SyncServer.
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Minimum interval between accepted edits per client.
    pub cooldown: Duration,
    /// Persistence strategy.
    pub persist: PersistPolicy,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            width: 16_000,
            height: 16_000,
            cooldown: Duration::from_secs(30),
            persist: PersistPolicy::WriteThrough,
        }
    }
}

/// A single client connection.
pub struct SessionConnection {
    /// Server-assigned connection identifier.
    pub session_id: SessionId,
    /// Stable identifier the client sent in `Hello`, if any.
    pub client_id: Option<String>,
    /// Display name, set on first chat message.
    pub username: Option<String>,
    /// Channel to send messages to this client.
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// When the connection was established.
    pub connected_at: Instant,
}

impl SessionConnection {
    pub fn new(session_id: impl Into<SessionId>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: None,
            username: None,
            tx,
            connected_at: Instant::now(),
        }
    }

    /// Send a message to this client. Delivery is best-effort; a closed
    /// channel means the connection is already going away.
    pub fn send(&self, msg: ServerMessage) -> SyncResult<()> {
        self.tx.send(msg).map_err(|_| SyncError::ConnectionClosed)
    }
}

/// Grid plus its dirty flag, guarded by one mutex so mutation, persistence
/// and broadcast are atomic relative to other edits.
struct CanvasState {
    grid: GridState,
    dirty: bool,
}

/// The main synchronization server.
pub struct SyncServer {
    /// Server configuration.
    config: SyncServerConfig,
    /// The authoritative canvas.
    canvas: Mutex<CanvasState>,
    /// Connected sessions.
    sessions: DashMap<SessionId, Arc<RwLock<SessionConnection>>>,
    /// Server-side per-client edit throttle.
    gate: EditGate,
    /// Persistent storage.
    store: CanvasStore,
    /// Server start time.
    started_at: Instant,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server, loading any persisted canvas state.
    /// Missing or corrupt state starts an empty grid, never a failure.
    pub fn new(store: CanvasStore, config: SyncServerConfig) -> Self {
        let grid = store.load();
        info!(
            pixels = grid.len(),
            width = config.width,
            height = config.height,
            "canvas initialized"
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            gate: EditGate::new(config.cooldown),
            config,
            canvas: Mutex::new(CanvasState { grid, dirty: false }),
            sessions: DashMap::new(),
            store,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Create with default configuration.
    pub fn with_store(store: CanvasStore) -> Self {
        Self::new(store, SyncServerConfig::default())
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get a shutdown receiver.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register a new connection: replay the full canvas to it, then tell
    /// everyone the new online count.
    ///
    /// Runs under the canvas lock so the snapshot and subsequent edit
    /// broadcasts can neither miss nor duplicate an edit.
    pub fn register_session(&self, session_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        let canvas = self.canvas.lock();

        let connection = Arc::new(RwLock::new(SessionConnection::new(session_id, tx)));
        self.sessions.insert(session_id.to_string(), connection.clone());

        // A dense canvas can exceed the frame size cap, so the snapshot goes
        // out in chunks; the final one tells the client to apply it.
        let snapshot = canvas.grid.snapshot();
        let total = snapshot.len();
        {
            let connection = connection.read();
            if total == 0 {
                let _ = connection.send(ServerMessage::Init {
                    pixels: Vec::new(),
                    done: true,
                });
            } else {
                let mut sent = 0;
                for chunk in snapshot.chunks(SNAPSHOT_CHUNK_PIXELS) {
                    sent += chunk.len();
                    let _ = connection.send(ServerMessage::Init {
                        pixels: chunk.to_vec(),
                        done: sent == total,
                    });
                }
            }
        }
        self.broadcast_to_all(ServerMessage::OnlineCount {
            count: self.sessions.len(),
        });

        info!(session_id, online = self.sessions.len(), "session connected");
    }

    /// Unregister a connection. If the client ever set a display name,
    /// everyone gets a "user left" notice; the online count follows.
    pub fn unregister_session(&self, session_id: &str) {
        if let Some((_, connection)) = self.sessions.remove(session_id) {
            let username = connection.read().username.clone();
            if let Some(username) = username {
                self.broadcast_to_all(ServerMessage::UserLeft { username });
            }
            self.broadcast_to_all(ServerMessage::OnlineCount {
                count: self.sessions.len(),
            });
            info!(session_id, online = self.sessions.len(), "session disconnected");
        }
    }

    /// Record the stable client id (and optionally a name) from `Hello`.
    pub fn identify_session(
        &self,
        session_id: &str,
        client_id: Option<String>,
        username: Option<String>,
    ) -> SyncResult<()> {
        let connection = self.get_session(session_id)?;
        let mut connection = connection.write();
        connection.client_id = client_id;
        if username.is_some() {
            connection.username = username;
        }
        Ok(())
    }

    /// Handle one edit event from a client.
    ///
    /// Validate, throttle, apply, persist, broadcast to everyone else —
    /// in that order, so a rejected edit mutates nothing and reaches no one.
    pub fn handle_edit(&self, session_id: &str, edit: Edit) -> SyncResult<()> {
        let connection = self.get_session(session_id)?;

        if edit.x >= self.config.width || edit.y >= self.config.height {
            return Err(SyncError::OutOfBounds {
                x: edit.x,
                y: edit.y,
                width: self.config.width,
                height: self.config.height,
            });
        }

        // Throttle on the stable client id so reconnecting does not reset
        // the window; anonymous sessions fall back to the connection id.
        let gate_key = {
            let connection = connection.read();
            connection
                .client_id
                .clone()
                .unwrap_or_else(|| connection.session_id.clone())
        };
        self.gate
            .check_and_stamp(&gate_key)
            .map_err(SyncError::RateLimited)?;

        let mut canvas = self.canvas.lock();
        canvas.grid.apply(&edit);
        canvas.dirty = true;

        if self.config.persist == PersistPolicy::WriteThrough {
            // A failed save is logged and retried on the next edit; losing
            // durability is preferable to losing availability.
            match self.store.save(&canvas.grid) {
                Ok(()) => canvas.dirty = false,
                Err(e) => error!(error = %e, "failed to persist canvas"),
            }
        }

        self.broadcast_to_others(
            session_id,
            ServerMessage::Pixel {
                x: edit.x,
                y: edit.y,
                color: edit.color,
            },
        );

        debug!(session_id, x = edit.x, y = edit.y, erase = edit.color.is_none(), "edit applied");
        Ok(())
    }

    /// Handle a chat message: remember the sender's display name (first
    /// sighting also announces them), then echo verbatim to everyone
    /// including the sender.
    pub fn handle_chat(&self, session_id: &str, chat: ChatMessage) -> SyncResult<()> {
        let connection = self.get_session(session_id)?;

        let newly_named = {
            let mut connection = connection.write();
            let first = connection.username.is_none();
            connection.username = Some(chat.username.clone());
            first
        };

        if newly_named {
            self.broadcast_to_all(ServerMessage::UserJoined {
                username: chat.username.clone(),
            });
        }
        self.broadcast_to_all(ServerMessage::Chat(chat));
        Ok(())
    }

    /// Broadcast a message to every connected session.
    pub fn broadcast_to_all(&self, msg: ServerMessage) {
        for entry in self.sessions.iter() {
            let _ = entry.value().read().send(msg.clone());
        }
    }

    /// Broadcast a message to every session except the sender, who already
    /// applied the edit locally on submission.
    pub fn broadcast_to_others(&self, exclude: &str, msg: ServerMessage) {
        for entry in self.sessions.iter() {
            if entry.key() != exclude {
                let _ = entry.value().read().send(msg.clone());
            }
        }
    }

    fn get_session(&self, session_id: &str) -> SyncResult<Arc<RwLock<SessionConnection>>> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))
    }

    /// Current grid snapshot, for tests and diagnostics.
    pub fn grid_snapshot(&self) -> GridState {
        self.canvas.lock().grid.clone()
    }

    /// Pixel lookup without cloning the whole grid.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        self.canvas.lock().grid.get(x, y)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    /// Save the canvas if it has unsaved changes. Returns whether a save
    /// was attempted.
    pub fn save_if_dirty(&self) -> bool {
        let mut canvas = self.canvas.lock();
        if !canvas.dirty {
            return false;
        }
        match self.store.save(&canvas.grid) {
            Ok(()) => canvas.dirty = false,
            Err(e) => error!(error = %e, "failed to persist canvas"),
        }
        true
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            online: self.sessions.len(),
            pixels: self.canvas.lock().grid.len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start background tasks: the debounced save loop (when configured)
    /// and edit-gate pruning.
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let save_task = match self.config.persist {
            PersistPolicy::Debounced { interval } => {
                let server = self.clone();
                Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    let mut shutdown = server.shutdown_receiver();

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if server.save_if_dirty() {
                                    debug!("debounced canvas save");
                                }
                            }
                            _ = shutdown.recv() => {
                                info!("save task shutting down");
                                server.save_if_dirty();
                                break;
                            }
                        }
                    }
                }))
            }
            PersistPolicy::WriteThrough => None,
        };

        let server = self.clone();
        let prune_interval = if self.config.cooldown.is_zero() {
            Duration::from_secs(60)
        } else {
            self.config.cooldown
        };
        let prune_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prune_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        server.gate.prune();
                    }
                    _ = shutdown.recv() => {
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task,
            prune_task,
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        let canvas = self.canvas.get_mut();
        if canvas.dirty {
            if let Err(e) = self.store.save(&canvas.grid) {
                warn!(error = %e, "final canvas save failed");
            }
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub online: usize,
    pub pixels: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks.
pub struct BackgroundTaskHandles {
    pub save_task: Option<tokio::task::JoinHandle<()>>,
    pub prune_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete.
    pub async fn wait(self) {
        if let Some(save) = self.save_task {
            let _ = save.await;
        }
        let _ = self.prune_task.await;
    }
}
