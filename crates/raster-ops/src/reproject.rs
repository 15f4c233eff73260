//! Resampling a grid onto a target projection and pixel grid.

use crate::interpolation::{sample, ResampleMethod};
use crate::projection::ProjectionRegistry;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sift_common::{GeoTransform, Result, SiftError};

/// Target projection and pixel grid of a reprojection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGrid {
    pub projection: String,
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Negative for north-up grids.
    pub pixel_height: f64,
    pub rows: usize,
    pub cols: usize,
}

impl TargetGrid {
    /// North-up grid covering `bbox`-like bounds at a square pixel size.
    pub fn covering(
        projection: impl Into<String>,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        pixel_size: f64,
    ) -> Self {
        let cols = ((max_x - min_x) / pixel_size).ceil().max(1.0) as usize;
        let rows = ((max_y - min_y) / pixel_size).ceil().max(1.0) as usize;
        Self {
            projection: projection.into(),
            origin_x: min_x,
            origin_y: max_y,
            pixel_width: pixel_size,
            pixel_height: -pixel_size,
            rows,
            cols,
        }
    }

    pub fn geotransform(&self) -> GeoTransform {
        GeoTransform::new(
            self.origin_x,
            self.origin_y,
            self.pixel_width,
            self.pixel_height,
            self.projection.clone(),
        )
    }

    /// The same extent at `factor` times coarser pixels, dimensions rounded up.
    pub fn scaled(&self, factor: usize) -> Self {
        if factor <= 1 {
            return self.clone();
        }
        Self {
            pixel_width: self.pixel_width * factor as f64,
            pixel_height: self.pixel_height * factor as f64,
            rows: self.rows.div_ceil(factor),
            cols: self.cols.div_ceil(factor),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.rows == 0 || self.cols == 0 {
            return Err("target grid must have at least one row and column".to_string());
        }
        if self.pixel_width == 0.0 || self.pixel_height == 0.0 {
            return Err("target pixel size must be non-zero".to_string());
        }
        Ok(())
    }
}

/// A source grid to be resampled.
#[derive(Debug, Clone, Copy)]
pub struct SourceGrid<'a> {
    pub data: &'a [f32],
    pub rows: usize,
    pub cols: usize,
    pub geotransform: &'a GeoTransform,
    pub nodata: Option<f32>,
}

/// Resample `source` onto `target`.
///
/// Each target pixel center is mapped target CRS → lon/lat → source CRS →
/// source pixel and sampled with `method`. Positions outside the source
/// coverage or either projection's domain become NaN.
pub fn reproject(
    source: SourceGrid<'_>,
    target: &TargetGrid,
    method: ResampleMethod,
    projections: &ProjectionRegistry,
) -> Result<Vec<f32>> {
    target.validate().map_err(SiftError::Projection)?;
    if source.data.len() != source.rows * source.cols {
        return Err(SiftError::Projection(format!(
            "source has {} values, expected {}x{}",
            source.data.len(),
            source.rows,
            source.cols
        )));
    }

    let src_proj = projections.get(&source.geotransform.projection)?;
    let dst_proj = projections.get(&target.projection)?;
    let same_crs = src_proj.name() == dst_proj.name();
    let dst_gt = target.geotransform();

    let mut output = vec![f32::NAN; target.rows * target.cols];
    output
        .par_chunks_mut(target.cols)
        .enumerate()
        .for_each(|(row, out)| {
            for (col, cell) in out.iter_mut().enumerate() {
                let (x, y) = dst_gt.pixel_center(col, row);

                let src_xy = if same_crs {
                    Some((x, y))
                } else {
                    dst_proj
                        .to_lonlat(x, y)
                        .and_then(|(lon, lat)| src_proj.from_lonlat(lon, lat))
                };

                if let Some((sx, sy)) = src_xy {
                    let (px, py) = source.geotransform.world_to_pixel(sx, sy);
                    // world_to_pixel is edge-based; samplers are center-based.
                    *cell = sample(
                        method,
                        source.data,
                        source.cols,
                        source.rows,
                        px - 0.5,
                        py - 0.5,
                        source.nodata,
                    );
                }
            }
        });

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geographic_source() -> (Vec<f32>, GeoTransform) {
        // 4x4 degree cells covering lon 0..4, lat 0..4
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        (data, GeoTransform::north_up(0.0, 4.0, 1.0, "EPSG:4326"))
    }

    #[test]
    fn test_identity_reprojection_preserves_values() {
        let (data, gt) = geographic_source();
        let target = TargetGrid::covering("EPSG:4326", 0.0, 0.0, 4.0, 4.0, 1.0);
        let source = SourceGrid {
            data: &data,
            rows: 4,
            cols: 4,
            geotransform: &gt,
            nodata: None,
        };

        let out = reproject(source, &target, ResampleMethod::Nearest, &ProjectionRegistry::default())
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_outside_coverage_is_nodata() {
        let (data, gt) = geographic_source();
        let target = TargetGrid::covering("EPSG:4326", 2.0, 2.0, 8.0, 4.0, 1.0);
        let source = SourceGrid {
            data: &data,
            rows: 4,
            cols: 4,
            geotransform: &gt,
            nodata: None,
        };

        let out = reproject(source, &target, ResampleMethod::Bilinear, &ProjectionRegistry::default())
            .unwrap();
        assert_eq!(out.len(), 2 * 6);
        assert!(!out[0].is_nan());
        assert!(out[5].is_nan());
    }

    #[test]
    fn test_geographic_to_mercator_samples_source() {
        let data = vec![5.0f32; 16];
        let gt = GeoTransform::north_up(-2.0, 2.0, 1.0, "EPSG:4326");
        let target = TargetGrid::covering("EPSG:3857", -100_000.0, -100_000.0, 100_000.0, 100_000.0, 50_000.0);
        let source = SourceGrid {
            data: &data,
            rows: 4,
            cols: 4,
            geotransform: &gt,
            nodata: None,
        };

        let out = reproject(source, &target, ResampleMethod::Bilinear, &ProjectionRegistry::default())
            .unwrap();
        assert!(out.iter().all(|v| (*v - 5.0).abs() < 1e-6));
    }

    #[test]
    fn test_unknown_projection_is_error() {
        let (data, gt) = geographic_source();
        let target = TargetGrid::covering("EPSG:32633", 0.0, 0.0, 10.0, 10.0, 1.0);
        let source = SourceGrid {
            data: &data,
            rows: 4,
            cols: 4,
            geotransform: &gt,
            nodata: None,
        };
        let err = reproject(source, &target, ResampleMethod::Nearest, &ProjectionRegistry::default())
            .unwrap_err();
        assert!(matches!(err, SiftError::Projection(_)));
    }

    #[test]
    fn test_scaled_target_covers_same_extent() {
        let target = TargetGrid::covering("EPSG:4326", 0.0, 0.0, 5.0, 3.0, 1.0);
        let scaled = target.scaled(2);
        assert_eq!((scaled.rows, scaled.cols), (2, 3));
        assert_eq!(scaled.pixel_width, 2.0);
        assert_eq!(scaled.origin_y, 3.0);
    }
}
