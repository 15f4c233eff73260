//! Notifications delivered to the renderer.

use cache_store::{CacheEntry, EntryView};
use serde::Serialize;
use sift_common::{GeoTransform, PixelWindow, SiftError, TileCoord};

/// Lifecycle of a tile within the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TileState {
    Requested,
    Building,
    Ready,
    /// Superseded by a newer viewport before finishing, or stopped by
    /// shutdown.
    Cancelled,
    Failed,
    TimedOut,
}

impl TileState {
    /// No further transitions happen within the same epoch.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TileState::Requested | TileState::Building)
    }
}

/// A ready tile: a window into a cached entry. No pixels are copied until
/// the consumer asks for them.
#[derive(Clone)]
pub struct TileView {
    view: EntryView,
    window: PixelWindow,
}

impl TileView {
    pub(crate) fn new(view: EntryView, window: PixelWindow) -> Self {
        Self { view, window }
    }

    pub fn window(&self) -> PixelWindow {
        self.window
    }

    /// The level (or derived product) entry the tile is cut from.
    pub fn entry(&self) -> &CacheEntry {
        self.view.entry()
    }

    pub fn rows(&self) -> usize {
        self.window.rows
    }

    pub fn cols(&self) -> usize {
        self.window.cols
    }

    /// Whether the underlying entry is still in the store.
    pub fn is_valid(&self) -> bool {
        self.view.is_valid()
    }

    /// Borrowed row slices of the tile.
    pub fn row_slices(&self) -> Vec<&[u8]> {
        self.view.window_rows(&self.window)
    }

    /// Tile bytes copied into one contiguous row-major buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.view.copy_window(&self.window)
    }

    /// Tile values for float32 entries.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        let values = self.view.as_f32()?;
        let cols = self.entry().shape.cols;
        let mut out = Vec::with_capacity(self.window.len());
        for row in self.window.row..self.window.row_end() {
            let start = row * cols + self.window.col;
            out.extend_from_slice(&values[start..start + self.window.cols]);
        }
        Some(out)
    }
}

impl std::fmt::Debug for TileView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileView")
            .field("key", &self.view.key())
            .field("window", &self.window)
            .finish()
    }
}

/// Why a tile will not arrive.
#[derive(Debug, Clone)]
pub enum Tombstone {
    /// The build outlived the job timeout. It may still finish and populate
    /// the cache.
    TimedOut,
    Failed(SiftError),
}

impl std::fmt::Display for Tombstone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tombstone::TimedOut => f.write_str("timed out"),
            Tombstone::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TileEventKind {
    Ready(TileView),
    Unavailable(Tombstone),
}

/// Sent once per tile per epoch.
#[derive(Debug, Clone)]
pub struct TileEvent {
    pub epoch: u64,
    pub product: String,
    pub coord: TileCoord,
    /// Geotransform of the tile's top-left pixel at its level.
    pub geotransform: GeoTransform,
    pub kind: TileEventKind,
}

impl TileEvent {
    pub fn is_ready(&self) -> bool {
        matches!(self.kind, TileEventKind::Ready(_))
    }

    pub fn tile(&self) -> Option<&TileView> {
        match &self.kind {
            TileEventKind::Ready(tile) => Some(tile),
            TileEventKind::Unavailable(_) => None,
        }
    }

    pub fn state(&self) -> TileState {
        match &self.kind {
            TileEventKind::Ready(_) => TileState::Ready,
            TileEventKind::Unavailable(Tombstone::TimedOut) => TileState::TimedOut,
            TileEventKind::Unavailable(Tombstone::Failed(_)) => TileState::Failed,
        }
    }
}
