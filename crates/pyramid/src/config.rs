//! Configuration for the pyramid builder.

use raster_ops::AggregationMethod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for pyramid construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    /// Linear reduction between consecutive levels.
    pub factor: u32,

    /// Deepest level that may be requested.
    pub max_level: u32,

    /// Aggregation applied when a product has no explicit entry.
    /// `None` picks a method from the product name.
    pub default_aggregation: Option<AggregationMethod>,

    /// Per-product aggregation, keyed by dataset name.
    pub aggregation_by_product: HashMap<String, AggregationMethod>,

    /// Target rows per read when importing level 0.
    pub read_increment_rows: usize,

    /// Upper bound on rows per read when importing level 0.
    pub max_read_rows: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            factor: 2,
            max_level: 16,
            default_aggregation: None,
            aggregation_by_product: HashMap::new(),
            read_increment_rows: 512,
            max_read_rows: 2048,
        }
    }
}

impl PyramidConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SIFT_PYRAMID_FACTOR") {
            if let Ok(factor) = val.parse() {
                self.factor = factor;
            }
        }

        if let Ok(val) = std::env::var("SIFT_PYRAMID_MAX_LEVEL") {
            if let Ok(level) = val.parse() {
                self.max_level = level;
            }
        }

        if let Ok(val) = std::env::var("SIFT_PYRAMID_AGGREGATION") {
            if let Ok(method) = val.parse() {
                self.default_aggregation = Some(method);
            }
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.factor < 2 {
            return Err("factor must be >= 2".to_string());
        }

        if self.max_level > 30 {
            return Err("max_level must be <= 30".to_string());
        }

        if self.read_increment_rows == 0 || self.max_read_rows == 0 {
            return Err("read increments must be > 0".to_string());
        }

        Ok(())
    }

    /// Aggregation method for a product.
    pub fn aggregation_for(&self, product: &str) -> AggregationMethod {
        if let Some(method) = self.aggregation_by_product.get(product) {
            return *method;
        }
        self.default_aggregation
            .unwrap_or_else(|| AggregationMethod::for_product(product))
    }

    /// Rows per read for a source with the given native block height:
    /// whole blocks adding up to at least `read_increment_rows`, capped at
    /// `max_read_rows`.
    pub fn read_block_rows(&self, block_height: usize) -> usize {
        let block = block_height.max(1);
        let blocks = self.read_increment_rows.div_ceil(block);
        (block * blocks).min(self.max_read_rows).max(1)
    }

    /// Linear scale of `level` relative to level 0.
    pub fn scale(&self, level: u32) -> usize {
        (self.factor as usize).saturating_pow(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PyramidConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scale(3), 8);
    }

    #[test]
    fn test_read_block_rows() {
        let config = PyramidConfig::default();
        assert_eq!(config.read_block_rows(1), 512);
        assert_eq!(config.read_block_rows(200), 600);
        assert_eq!(config.read_block_rows(1500), 1500);
        assert_eq!(config.read_block_rows(4096), 2048);
    }

    #[test]
    fn test_aggregation_lookup() {
        let mut config = PyramidConfig::default();
        config
            .aggregation_by_product
            .insert("B04".to_string(), AggregationMethod::Max);

        assert_eq!(config.aggregation_for("B04"), AggregationMethod::Max);
        assert_eq!(config.aggregation_for("B03"), AggregationMethod::Mean);
        assert_eq!(config.aggregation_for("land_mask"), AggregationMethod::Nearest);

        config.default_aggregation = Some(AggregationMethod::Max);
        assert_eq!(config.aggregation_for("land_mask"), AggregationMethod::Max);
    }

    #[test]
    fn test_invalid_factor() {
        let config = PyramidConfig {
            factor: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
