//! Interpolation methods for grid resampling.
//!
//! Sample positions are fractional pixel coordinates in which integer values
//! sit on pixel centers: `(0.0, 0.0)` is the center of the top-left pixel.

use serde::{Deserialize, Serialize};
use sift_common::is_nodata;

/// How to sample a source grid at a fractional position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    Nearest,
    #[default]
    Bilinear,
}

impl ResampleMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResampleMethod::Nearest => "nearest",
            ResampleMethod::Bilinear => "bilinear",
        }
    }
}

/// Nearest neighbor interpolation.
///
/// Returns NaN outside the grid or on no-data.
pub fn nearest_interpolate(
    data: &[f32],
    width: usize,
    height: usize,
    x: f64,
    y: f64,
    nodata: Option<f32>,
) -> f32 {
    let col = x.round();
    let row = y.round();

    if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
        return f32::NAN;
    }

    let v = data[row as usize * width + col as usize];
    if is_nodata(v, nodata) {
        f32::NAN
    } else {
        v
    }
}

/// Bilinear interpolation over the four surrounding pixel centers.
///
/// Corners holding no-data are left out and the remaining weights are
/// renormalized; NaN only when every contributing corner is no-data.
/// Positions within half a pixel of the edge clamp to the edge pixels.
pub fn bilinear_interpolate(
    data: &[f32],
    width: usize,
    height: usize,
    x: f64,
    y: f64,
    nodata: Option<f32>,
) -> f32 {
    if width == 0 || height == 0 {
        return f32::NAN;
    }
    if x < -0.5 || y < -0.5 || x > width as f64 - 0.5 || y > height as f64 - 0.5 {
        return f32::NAN;
    }

    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let xf = x - x0 as f64;
    let yf = y - y0 as f64;

    let corners = [
        (data[y0 * width + x0], (1.0 - xf) * (1.0 - yf)),
        (data[y0 * width + x1], xf * (1.0 - yf)),
        (data[y1 * width + x0], (1.0 - xf) * yf),
        (data[y1 * width + x1], xf * yf),
    ];

    let mut sum = 0.0f64;
    let mut weight = 0.0f64;
    for (v, w) in corners {
        if w > 0.0 && !is_nodata(v, nodata) {
            sum += v as f64 * w;
            weight += w;
        }
    }

    if weight <= f64::EPSILON {
        f32::NAN
    } else {
        (sum / weight) as f32
    }
}

/// Sample with the given method.
#[inline]
pub fn sample(
    method: ResampleMethod,
    data: &[f32],
    width: usize,
    height: usize,
    x: f64,
    y: f64,
    nodata: Option<f32>,
) -> f32 {
    match method {
        ResampleMethod::Nearest => nearest_interpolate(data, width, height, x, y, nodata),
        ResampleMethod::Bilinear => bilinear_interpolate(data, width, height, x, y, nodata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_interpolate() {
        let data: Vec<f32> = vec![
            1.0, 2.0, 3.0,
            4.0, 5.0, 6.0,
            7.0, 8.0, 9.0,
        ];

        assert_eq!(nearest_interpolate(&data, 3, 3, 0.0, 0.0, None), 1.0);
        assert_eq!(nearest_interpolate(&data, 3, 3, 1.0, 1.0, None), 5.0);
        assert_eq!(nearest_interpolate(&data, 3, 3, 0.4, 0.4, None), 1.0);
        assert_eq!(nearest_interpolate(&data, 3, 3, 0.6, 0.6, None), 5.0);
        assert!(nearest_interpolate(&data, 3, 3, -1.0, 0.0, None).is_nan());
    }

    #[test]
    fn test_bilinear_interpolate() {
        let data: Vec<f32> = vec![
            1.0, 2.0,
            3.0, 4.0,
        ];

        // Corners
        assert_eq!(bilinear_interpolate(&data, 2, 2, 0.0, 0.0, None), 1.0);
        assert_eq!(bilinear_interpolate(&data, 2, 2, 1.0, 0.0, None), 2.0);
        assert_eq!(bilinear_interpolate(&data, 2, 2, 0.0, 1.0, None), 3.0);
        assert_eq!(bilinear_interpolate(&data, 2, 2, 1.0, 1.0, None), 4.0);

        // Center
        let center = bilinear_interpolate(&data, 2, 2, 0.5, 0.5, None);
        assert!((center - 2.5).abs() < 0.001);
    }

    #[test]
    fn test_bilinear_renormalizes_over_valid_corners() {
        let data: Vec<f32> = vec![
            1.0, f32::NAN,
            3.0, 4.0,
        ];

        // Remaining corners weigh equally at the center: (1 + 3 + 4) / 3
        let result = bilinear_interpolate(&data, 2, 2, 0.5, 0.5, None);
        assert!((result - 8.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_bilinear_all_nodata_is_nan() {
        let data = vec![-1.0f32; 4];
        assert!(bilinear_interpolate(&data, 2, 2, 0.5, 0.5, Some(-1.0)).is_nan());
    }

    #[test]
    fn test_bilinear_outside_grid_is_nan() {
        let data = vec![1.0f32; 4];
        assert!(bilinear_interpolate(&data, 2, 2, 2.0, 0.0, None).is_nan());
        assert_eq!(bilinear_interpolate(&data, 2, 2, -0.4, 0.0, None), 1.0);
    }
}
