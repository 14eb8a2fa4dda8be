//! The authoritative in-memory pixel grid.
//!
//! `GridState` is the single source of truth for the canvas. It is a plain
//! coordinate -> color map with no networking or validation concerns:
//! bounds checking is the SyncServer's job, so this type never becomes the
//! authority on protocol-level legality. Absence of a coordinate is a real
//! state, distinct from any color (including background-looking ones).

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A grid coordinate. Validity against the configured canvas size is
/// checked at the protocol boundary, not here.
pub type Coord = (u32, u32);

/// A 24-bit RGB color, serialized on the wire and on disk as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Error for malformed color strings.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid color string: {0:?} (expected #RRGGBB)")]
pub struct ParseColorError(pub String);

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .filter(|h| h.len() == 6 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| ParseColorError(s.to_string()))?;
        let value = u32::from_str_radix(hex, 16).map_err(|_| ParseColorError(s.to_string()))?;
        Ok(Self {
            r: (value >> 16) as u8,
            g: (value >> 8) as u8,
            b: value as u8,
        })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

/// A single accepted mutation: set a coordinate to a color, or erase it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub x: u32,
    pub y: u32,
    /// `None` means erase (remove the entry entirely).
    pub color: Option<Color>,
}

impl Edit {
    pub fn set(x: u32, y: u32, color: Color) -> Self {
        Self {
            x,
            y,
            color: Some(color),
        }
    }

    pub fn erase(x: u32, y: u32) -> Self {
        Self { x, y, color: None }
    }
}

/// The complete coordinate -> color mapping.
///
/// A BTreeMap keeps snapshot order deterministic, which makes the full-state
/// transfer to new clients and the persisted file layout stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridState {
    pixels: BTreeMap<Coord, Color>,
}

impl GridState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Color> {
        self.pixels.get(&(x, y)).copied()
    }

    pub fn set(&mut self, x: u32, y: u32, color: Color) {
        self.pixels.insert((x, y), color);
    }

    pub fn erase(&mut self, x: u32, y: u32) {
        self.pixels.remove(&(x, y));
    }

    /// Apply one edit with set/erase semantics. Shared by the server and
    /// the client-side mirror so both converge on identical state.
    pub fn apply(&mut self, edit: &Edit) {
        match edit.color {
            Some(color) => self.set(edit.x, edit.y, color),
            None => self.erase(edit.x, edit.y),
        }
    }

    /// Full ordered state, the unit of both persistence and initial sync.
    pub fn snapshot(&self) -> Vec<(Coord, Color)> {
        self.pixels.iter().map(|(&c, &color)| (c, color)).collect()
    }

    /// Rebuild a grid from a snapshot, replacing everything.
    pub fn from_snapshot(entries: impl IntoIterator<Item = (Coord, Color)>) -> Self {
        Self {
            pixels: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}
