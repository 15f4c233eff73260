//! Tile addressing within pyramid levels.

use crate::{PixelWindow, RasterShape};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tile coordinate: pyramid level plus row/column in that level's tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub level: u32,
    pub row: u32,
    pub col: u32,
}

impl TileCoord {
    pub fn new(level: u32, row: u32, col: u32) -> Self {
        Self { level, row, col }
    }

    /// Tile at the next coarser level that contains this tile, given the
    /// pyramid reduction factor.
    pub fn parent(&self, factor: u32) -> TileCoord {
        let factor = factor.max(1);
        TileCoord {
            level: self.level + 1,
            row: self.row / factor,
            col: self.col / factor,
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.row, self.col)
    }
}

/// Regular tile grid laid over a pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    pub tile_width: usize,
    pub tile_height: usize,
}

impl Default for TileGrid {
    fn default() -> Self {
        Self {
            tile_width: 512,
            tile_height: 512,
        }
    }
}

impl TileGrid {
    pub fn new(tile_width: usize, tile_height: usize) -> Self {
        Self {
            tile_width: tile_width.max(1),
            tile_height: tile_height.max(1),
        }
    }

    /// Number of (tile rows, tile columns) needed to cover a level.
    pub fn dims(&self, shape: &RasterShape) -> (usize, usize) {
        (
            shape.rows.div_ceil(self.tile_height),
            shape.cols.div_ceil(self.tile_width),
        )
    }

    /// Pixel window of a tile, clipped at the level's right/bottom edges.
    pub fn tile_window(&self, coord: &TileCoord, shape: &RasterShape) -> Option<PixelWindow> {
        let row = coord.row as usize * self.tile_height;
        let col = coord.col as usize * self.tile_width;
        if row >= shape.rows || col >= shape.cols {
            return None;
        }
        Some(PixelWindow::new(
            row,
            col,
            self.tile_height.min(shape.rows - row),
            self.tile_width.min(shape.cols - col),
        ))
    }

    /// All tiles of `level` that overlap a pixel window.
    pub fn tiles_covering(&self, level: u32, window: &PixelWindow) -> Vec<TileCoord> {
        if window.is_empty() {
            return Vec::new();
        }
        let first_row = window.row / self.tile_height;
        let last_row = (window.row_end() - 1) / self.tile_height;
        let first_col = window.col / self.tile_width;
        let last_col = (window.col_end() - 1) / self.tile_width;

        let mut tiles = Vec::with_capacity((last_row - first_row + 1) * (last_col - first_col + 1));
        for row in first_row..=last_row {
            for col in first_col..=last_col {
                tiles.push(TileCoord::new(level, row as u32, col as u32));
            }
        }
        tiles
    }
}
