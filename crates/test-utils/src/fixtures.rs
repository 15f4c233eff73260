//! Grids, timestamps and scratch directories used across the test suites.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// North-up grids with known geotransforms.
pub mod grid {
    use sift_common::GeoTransform;

    /// Shape and placement of a synthetic source.
    #[derive(Debug, Clone, Copy)]
    pub struct GridSpec {
        pub rows: usize,
        pub cols: usize,
        pub origin_x: f64,
        pub origin_y: f64,
        pub pixel_size: f64,
        pub projection: &'static str,
    }

    impl GridSpec {
        /// Cell count.
        pub fn size(&self) -> usize {
            self.rows * self.cols
        }

        pub fn geotransform(&self) -> GeoTransform {
            GeoTransform::north_up(self.origin_x, self.origin_y, self.pixel_size, self.projection)
        }
    }

    /// Small projected scene with 1m pixels.
    pub const SCENE_100: GridSpec = GridSpec {
        rows: 100,
        cols: 100,
        origin_x: 500_000.0,
        origin_y: 4_200_000.0,
        pixel_size: 1.0,
        projection: "EPSG:32633",
    };

    /// Geographic 1-degree global grid.
    pub const GLOBAL_1DEG: GridSpec = GridSpec {
        rows: 180,
        cols: 360,
        origin_x: -180.0,
        origin_y: 90.0,
        pixel_size: 1.0,
        projection: "EPSG:4326",
    };

    /// Odd-sized grid for exercising partial edge blocks.
    pub const ODD_5X7: GridSpec = GridSpec {
        rows: 5,
        cols: 7,
        origin_x: 0.0,
        origin_y: 5.0,
        pixel_size: 1.0,
        projection: "EPSG:4326",
    };
}

/// First time step of every fixture family.
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `n` timesteps spaced `minutes` apart starting at the reference time.
pub fn timesteps(n: usize, minutes: i64) -> Vec<DateTime<Utc>> {
    (0..n)
        .map(|i| reference_time() + Duration::minutes(minutes * i as i64))
        .collect()
}

/// Scratch directory with conventional subdirectories for a cache root and
/// source files. Removed on drop.
pub struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    pub fn new() -> Self {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => panic!("failed to create temp workspace: {}", e),
        };
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory for a cache store (not created; the store creates it).
    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Directory for source files, created on demand.
    pub fn sources_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("sources");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            panic!("failed to create sources dir: {}", e);
        }
        dir
    }

    /// Path of a file in the sources directory.
    pub fn source_path(&self, name: &str) -> PathBuf {
        self.sources_dir().join(name)
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_cell_counts() {
        assert_eq!(grid::SCENE_100.size(), 10_000);
        assert_eq!(grid::GLOBAL_1DEG.size(), 360 * 180);
    }

    #[test]
    fn test_grid_spec_geotransform() {
        let gt = grid::GLOBAL_1DEG.geotransform();
        let bbox = gt.footprint(grid::GLOBAL_1DEG.rows, grid::GLOBAL_1DEG.cols);
        assert_eq!(bbox.min_x, -180.0);
        assert_eq!(bbox.max_y, 90.0);
    }

    #[test]
    fn test_reference_time() {
        assert_eq!(reference_time().to_rfc3339(), "2024-06-01T10:30:00+00:00");
        let steps = timesteps(3, 10);
        assert_eq!(steps[2] - steps[0], Duration::minutes(20));
    }

    #[test]
    fn test_temp_workspace_layout() {
        let ws = TempWorkspace::new();
        assert!(ws.sources_dir().is_dir());
        assert!(ws.source_path("a.f32").starts_with(ws.root()));
        assert!(!ws.cache_root().exists());
    }
}
