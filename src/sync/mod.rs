//! Real-time canvas synchronization.
//!
//! This module holds the core of the system: the authoritative grid, the
//! binary WebSocket protocol, the synchronization server that applies and
//! rebroadcasts edits, the server-side edit gate, and the client sync agent
//! that mirrors the canvas locally.

pub mod client;
pub mod grid;
pub mod limiter;
pub mod protocol;
pub mod server;

pub use grid::{Color, Edit, GridState};
pub use server::{SyncServer, SyncServerConfig};

use std::time::Duration;

use crate::storage::StoreError;

/// Unique identifier for a connection, assigned by the server.
pub type SessionId = String;

/// Stable identifier a client carries across sessions.
pub type ClientId = String;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("coordinate ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },

    #[error("edit cooldown active, retry in {0:?}")]
    RateLimited(Duration),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::OutOfBounds {
            x: 16000,
            y: 0,
            width: 16000,
            height: 16000,
        };
        assert_eq!(
            err.to_string(),
            "coordinate (16000, 0) is outside the 16000x16000 grid"
        );
    }
}
