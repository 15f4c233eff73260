//! Synthetic raster values.
//!
//! Every generator is row-major and deterministic so expected aggregates can
//! be worked out by hand.

use sift_common::RasterArray;

/// Cell value encodes its position: `col * 1000 + row`.
///
/// ```
/// use test_utils::create_test_grid;
///
/// let values = create_test_grid(3, 2);
/// assert_eq!(values, vec![0.0, 1000.0, 2000.0, 1.0, 1001.0, 2001.0]);
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<f32> {
    (0..height)
        .flat_map(|row| (0..width).map(move |col| (col * 1000 + row) as f32))
        .collect()
}

/// `1, 2, 3, ...` in row-major order.
///
/// A 4x4 ramp reduced by 2 with the mean gives `3.5, 5.5, 11.5, 13.5`.
pub fn create_ramp_grid(width: usize, height: usize) -> Vec<f32> {
    (1..=width * height).map(|v| v as f32).collect()
}

pub fn create_constant_grid(width: usize, height: usize, value: f32) -> Vec<f32> {
    vec![value; width * height]
}

/// Single-channel float32 array from generated values.
///
/// Panics on a length mismatch.
pub fn raster(rows: usize, cols: usize, values: Vec<f32>) -> RasterArray {
    match RasterArray::from_f32(rows, cols, values) {
        Ok(array) => array,
        Err(e) => panic!("invalid test raster: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_encoding() {
        let values = create_test_grid(10, 5);
        assert_eq!(values.len(), 50);
        // row 3, col 7
        assert_eq!(values[3 * 10 + 7], 7003.0);
    }

    #[test]
    fn test_ramp_bounds() {
        let values = create_ramp_grid(4, 4);
        assert_eq!(values.first(), Some(&1.0));
        assert_eq!(values.last(), Some(&16.0));
    }

    #[test]
    fn test_raster_shape() {
        let array = raster(3, 4, create_constant_grid(4, 3, 7.0));
        assert_eq!((array.shape.rows, array.shape.cols), (3, 4));
    }
}
