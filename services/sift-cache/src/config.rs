//! Engine configuration for the CLI.

use anyhow::{anyhow, Context, Result};
use cache_store::CacheConfig;
use pyramid::PyramidConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tile_scheduler::SchedulerConfig;

/// Everything the engine needs, as one YAML document:
///
/// ```yaml
/// cache:
///   root: /var/cache/sift
///   quota_bytes: 8589934592
/// pyramid:
///   aggregation_by_product:
///     REFL: max
/// scheduler:
///   tile_width: 256
///   tile_height: 256
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub pyramid: PyramidConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Load from a YAML file (or defaults), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_yaml(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn with_env_overrides(self) -> Self {
        Self {
            cache: self.cache.with_env_overrides(),
            pyramid: self.pyramid.with_env_overrides(),
            scheduler: self.scheduler.with_env_overrides(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate().map_err(|e| anyhow!("cache: {}", e))?;
        self.pyramid
            .validate()
            .map_err(|e| anyhow!("pyramid: {}", e))?;
        self.scheduler
            .validate()
            .map_err(|e| anyhow!("scheduler: {}", e))?;
        Ok(())
    }
}
