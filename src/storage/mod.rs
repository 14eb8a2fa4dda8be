//! Persistent storage for the pixel grid.
//!
//! The canvas is persisted as a single JSON file holding an array of
//! `["x,y", "#RRGGBB"]` pairs, rewritten wholesale. The write strategy is a
//! pluggable policy so the synchronization logic is unaffected by the
//! choice between write-through and periodic saves.

mod json_store;

pub use json_store::CanvasStore;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// When the full grid gets written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Save synchronously after every accepted edit. Each edit's latency
    /// includes one full-file rewrite; a failed save is retried on the
    /// next edit.
    WriteThrough,
    /// Mark the canvas dirty per edit and let a background task save at
    /// most once per interval, trading a small durability window for
    /// throughput.
    Debounced { interval: Duration },
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self::WriteThrough
    }
}

/// Configuration for the storage layer.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the canvas data file.
    pub path: PathBuf,
    /// Write strategy.
    pub policy: PersistPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/pixel_data.json"),
            policy: PersistPolicy::WriteThrough,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: PersistPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.policy, PersistPolicy::WriteThrough);
        assert!(config.path.ends_with("pixel_data.json"));
    }

    #[test]
    fn test_with_policy() {
        let config = StorageConfig::new("/tmp/canvas.json").with_policy(PersistPolicy::Debounced {
            interval: Duration::from_millis(500),
        });
        assert!(matches!(config.policy, PersistPolicy::Debounced { .. }));
    }
}
