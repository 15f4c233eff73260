//! Configuration for the cache store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for an on-disk cache store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the store.
    pub root: PathBuf,

    /// Maximum total size of stored entries in bytes.
    pub quota_bytes: u64,

    /// Maximum number of memory mappings kept open at once.
    pub max_open_maps: usize,

    /// fsync data and metadata files before publishing them.
    pub fsync: bool,

    /// Minimum spacing between index rewrites triggered by puts and
    /// evictions. `flush` and closing the store always write. Zero writes
    /// after every mutation.
    pub index_flush_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./sift-cache"),
            quota_bytes: 4 * 1024 * 1024 * 1024,
            max_open_maps: 256,
            fsync: true,
            index_flush_interval_ms: 1000,
        }
    }
}

impl CacheConfig {
    /// Config rooted at `root` with the given quota; other fields default.
    pub fn new(root: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            root: root.into(),
            quota_bytes,
            ..Self::default()
        }
    }

    /// Overlay values from environment variables onto this config.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SIFT_CACHE_DIR") {
            self.root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SIFT_CACHE_QUOTA_MB") {
            if let Ok(mb) = val.parse::<u64>() {
                self.quota_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(val) = std::env::var("SIFT_CACHE_MAX_OPEN_MAPS") {
            if let Ok(n) = val.parse() {
                self.max_open_maps = n;
            }
        }

        if let Ok(val) = std::env::var("SIFT_CACHE_INDEX_FLUSH_MS") {
            if let Ok(ms) = val.parse() {
                self.index_flush_interval_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("SIFT_CACHE_FSYNC") {
            self.fsync = val.to_lowercase() == "true" || val == "1";
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.quota_bytes == 0 {
            return Err("quota_bytes must be > 0".to_string());
        }

        if self.max_open_maps == 0 {
            return Err("max_open_maps must be > 0".to_string());
        }

        if self.root.as_os_str().is_empty() {
            return Err("root must not be empty".to_string());
        }

        Ok(())
    }

    /// Quota in megabytes, for display.
    pub fn quota_mb(&self) -> f64 {
        self.quota_bytes as f64 / (1024.0 * 1024.0)
    }
}
