//! Configuration for the tile scheduler.

use crate::level::LevelPolicy;
use serde::{Deserialize, Serialize};
use sift_common::TileGrid;
use std::time::Duration;

/// Configuration for viewport scheduling and tile workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tile width in pixels.
    pub tile_width: usize,

    /// Tile height in pixels.
    pub tile_height: usize,

    /// Maximum concurrently running tile jobs.
    pub workers: usize,

    /// Time after which a tile job's notification is replaced by a
    /// `TimedOut` tombstone. The build itself keeps running.
    pub build_timeout_ms: u64,

    /// Level selection policy.
    pub level_policy: LevelPolicy,

    /// Also queue tiles of the finest already-cached coarser level when the
    /// selected level is not cached yet.
    pub preview_cached_levels: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tile_width: 512,
            tile_height: 512,
            workers: 4,
            build_timeout_ms: 30_000,
            level_policy: LevelPolicy::default(),
            preview_cached_levels: true,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SIFT_TILE_SIZE") {
            if let Ok(size) = val.parse() {
                self.tile_width = size;
                self.tile_height = size;
            }
        }

        if let Ok(val) = std::env::var("SIFT_TILE_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.workers = workers;
            }
        }

        if let Ok(val) = std::env::var("SIFT_TILE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.build_timeout_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("SIFT_LEVEL_POLICY") {
            if let Ok(policy) = val.parse() {
                self.level_policy = policy;
            }
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err("tile dimensions must be > 0".to_string());
        }

        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }

        if self.build_timeout_ms == 0 {
            return Err("build_timeout_ms must be > 0".to_string());
        }

        Ok(())
    }

    pub fn tile_grid(&self) -> TileGrid {
        TileGrid::new(self.tile_width, self.tile_height)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}
