//! Pixelboard — a real-time shared pixel canvas.
//!
//! Many clients view and mutate one shared grid over WebSocket. The server
//! owns the authoritative state, rebroadcasts accepted edits, throttles
//! each client, and persists the full canvas across restarts.

pub mod app;
pub mod storage;
pub mod sync;
