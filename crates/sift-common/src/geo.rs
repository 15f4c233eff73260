//! Affine geotransforms and pixel windows.

use crate::BoundingBox;
use serde::{Deserialize, Serialize};

/// Tolerance used when snapping fractional pixel coordinates to whole pixels.
const PIXEL_SNAP_EPSILON: f64 = 1e-9;

/// Affine mapping between pixel space and the raster's projected space.
///
/// `origin_x`/`origin_y` locate the outer corner of pixel (0, 0). For
/// north-up rasters `pixel_height` is negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    /// Projection reference (e.g. "EPSG:4326" or a PROJ string).
    pub projection: String,
}

impl GeoTransform {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        pixel_width: f64,
        pixel_height: f64,
        projection: impl Into<String>,
    ) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            projection: projection.into(),
        }
    }

    /// North-up transform with square pixels.
    pub fn north_up(
        origin_x: f64,
        origin_y: f64,
        pixel_size: f64,
        projection: impl Into<String>,
    ) -> Self {
        Self::new(origin_x, origin_y, pixel_size, -pixel_size, projection)
    }

    /// Linear pixel size in projection units (the larger of the two axes).
    pub fn pixel_size(&self) -> f64 {
        self.pixel_width.abs().max(self.pixel_height.abs())
    }

    /// World coordinates of a (fractional) pixel position.
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }

    /// World coordinates of the center of pixel (col, row).
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        self.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Fractional pixel position of a world coordinate.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Extent covered by a raster of the given shape.
    pub fn footprint(&self, rows: usize, cols: usize) -> BoundingBox {
        let (x0, y0) = self.pixel_to_world(0.0, 0.0);
        let (x1, y1) = self.pixel_to_world(cols as f64, rows as f64);
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Same origin, pixels `factor` times larger.
    pub fn scaled(&self, factor: f64) -> GeoTransform {
        GeoTransform {
            origin_x: self.origin_x,
            origin_y: self.origin_y,
            pixel_width: self.pixel_width * factor,
            pixel_height: self.pixel_height * factor,
            projection: self.projection.clone(),
        }
    }

    /// Transform whose pixel (0, 0) is the window's top-left pixel.
    pub fn for_window(&self, window: &PixelWindow) -> GeoTransform {
        let (x, y) = self.pixel_to_world(window.col as f64, window.row as f64);
        GeoTransform {
            origin_x: x,
            origin_y: y,
            ..self.clone()
        }
    }

    /// Pixel window of a `rows` x `cols` raster covering `bbox`, clipped to
    /// the raster. Returns `None` when the box misses the raster entirely.
    pub fn window_for_bbox(
        &self,
        bbox: &BoundingBox,
        rows: usize,
        cols: usize,
    ) -> Option<PixelWindow> {
        let corners = [
            self.world_to_pixel(bbox.min_x, bbox.min_y),
            self.world_to_pixel(bbox.max_x, bbox.max_y),
        ];

        let col_lo = snap(corners[0].0.min(corners[1].0)).floor().max(0.0);
        let col_hi = snap(corners[0].0.max(corners[1].0)).ceil().min(cols as f64);
        let row_lo = snap(corners[0].1.min(corners[1].1)).floor().max(0.0);
        let row_hi = snap(corners[0].1.max(corners[1].1)).ceil().min(rows as f64);

        if !(col_lo < col_hi && row_lo < row_hi) {
            return None;
        }

        Some(PixelWindow::new(
            row_lo as usize,
            col_lo as usize,
            (row_hi - row_lo) as usize,
            (col_hi - col_lo) as usize,
        ))
    }
}

fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < PIXEL_SNAP_EPSILON {
        rounded
    } else {
        v
    }
}

/// A rectangular region of pixels: top-left `(row, col)` plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl PixelWindow {
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self {
            row,
            col,
            rows,
            cols,
        }
    }

    /// Exclusive end row.
    pub fn row_end(&self) -> usize {
        self.row + self.rows
    }

    /// Exclusive end column.
    pub fn col_end(&self) -> usize {
        self.col + self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Number of pixels in the window.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Overlap of two windows, if any.
    pub fn intersect(&self, other: &PixelWindow) -> Option<PixelWindow> {
        let row = self.row.max(other.row);
        let col = self.col.max(other.col);
        let row_end = self.row_end().min(other.row_end());
        let col_end = self.col_end().min(other.col_end());
        if row >= row_end || col >= col_end {
            return None;
        }
        Some(PixelWindow::new(row, col, row_end - row, col_end - col))
    }
}
