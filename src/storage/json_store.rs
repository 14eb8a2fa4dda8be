//! JSON-file canvas store.
//!
//! Layout on disk is a bare JSON array of `["x,y", "#RRGGBB"]` pairs, the
//! format the reference deployment shipped with. There is no schema version
//! field; that gap is accepted for compatibility. Saves replace the whole
//! file atomically (temp file + rename), so the file on disk is always one
//! complete snapshot, never a torn write.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{StorageConfig, StoreResult};
use crate::sync::grid::{Color, Coord, GridState};

/// File-backed store for the full pixel map.
#[derive(Debug, Clone)]
pub struct CanvasStore {
    path: PathBuf,
}

impl CanvasStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            path: config.path.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted grid.
    ///
    /// Missing file or any parse failure is a recoverable condition: the
    /// server starts from an empty grid with a warning, never a crash.
    pub fn load(&self) -> GridState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "no saved pixel data, starting fresh");
                return GridState::new();
            }
        };

        let pairs: Vec<(String, String)> = match serde_json::from_str(&raw) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt pixel data, starting fresh");
                return GridState::new();
            }
        };

        let mut entries: Vec<(Coord, Color)> = Vec::with_capacity(pairs.len());
        for (key, value) in &pairs {
            match (parse_coord_key(key), value.parse::<Color>()) {
                (Some(coord), Ok(color)) => entries.push((coord, color)),
                _ => {
                    warn!(key = %key, value = %value, "unreadable pixel entry, starting fresh");
                    return GridState::new();
                }
            }
        }

        debug!(pixels = entries.len(), "loaded saved pixel data");
        GridState::from_snapshot(entries)
    }

    /// Serialize the full grid and overwrite the file.
    pub fn save(&self, grid: &GridState) -> StoreResult<()> {
        let pairs: Vec<(String, String)> = grid
            .snapshot()
            .into_iter()
            .map(|((x, y), color)| (format!("{},{}", x, y), color.to_string()))
            .collect();

        let json = serde_json::to_string(&pairs)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write to a sibling temp file first so a crash mid-write leaves the
        // previous complete snapshot intact.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(pixels = grid.len(), path = %self.path.display(), "saved pixel data");
        Ok(())
    }
}

fn parse_coord_key(key: &str) -> Option<Coord> {
    let (x, y) = key.split_once(',')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::grid::Edit;
    use tempfile::tempdir;

    fn test_store(dir: &tempfile::TempDir) -> CanvasStore {
        CanvasStore::new(&StorageConfig::new(dir.path().join("pixel_data.json")))
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let mut grid = GridState::new();
        grid.set(0, 0, Color::new(0, 0, 0));
        grid.set(15999, 15999, Color::new(0xFF, 0xFF, 0xFF));
        grid.set(42, 7, "#00FF99".parse().unwrap());

        store.save(&grid).unwrap();
        assert_eq!(store.load(), grid);
    }

    #[test]
    fn test_empty_grid_round_trip() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        store.save(&GridState::new()).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_file_layout_is_pair_array() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let mut grid = GridState::new();
        grid.set(5, 5, "#00FF00".parse().unwrap());
        store.save(&grid).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let pairs: Vec<(String, String)> = serde_json::from_str(&raw).unwrap();
        assert_eq!(pairs, vec![("5,5".to_string(), "#00FF00".to_string())]);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        fs::write(store.path(), "{not json at all").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_bad_entry_loads_empty() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        // The entries contain `"#`, so the raw string needs a wider delimiter
        fs::write(store.path(), r##"[["5,5","#00FF00"],["oops","#XYZ"]]"##).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_overwrite_replaces_previous_state() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);

        let mut grid = GridState::new();
        grid.set(1, 1, Color::new(1, 1, 1));
        grid.set(2, 2, Color::new(2, 2, 2));
        store.save(&grid).unwrap();

        grid.apply(&Edit::erase(1, 1));
        store.save(&grid).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.get(1, 1), None);
        assert_eq!(loaded.get(2, 2), Some(Color::new(2, 2, 2)));
        assert_eq!(loaded.len(), 1);
    }
}
