//! Raster source descriptors.

use crate::{CacheKey, DataType, GeoTransform, RasterShape, Result, SiftError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// File modification signature: last-modified time plus length.
///
/// A changed file yields a new signature and therefore a new source key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSignature {
    pub modified_nanos: u128,
    pub len: u64,
}

impl SourceSignature {
    /// Read the signature from filesystem metadata.
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| {
            SiftError::source_read(format!("cannot stat {}: {}", path.display(), e))
        })?;
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self {
            modified_nanos,
            len: meta.len(),
        })
    }

    pub fn as_key_string(&self) -> String {
        format!("{}:{}", self.modified_nanos, self.len)
    }
}

/// Header-level description of a raster, available without decoding pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterInfo {
    pub rows: usize,
    pub cols: usize,
    pub geotransform: GeoTransform,
    pub no_data: Option<f32>,
    /// Human-readable dataset name (defaults to the file name).
    pub dataset_name: String,
    /// Element type as stored in the source file, before conversion.
    pub source_dtype: String,
    /// Native block height in rows; 1 for strip-less files.
    #[serde(default = "default_block_height")]
    pub block_height: usize,
}

fn default_block_height() -> usize {
    1
}

impl RasterInfo {
    pub fn shape(&self) -> RasterShape {
        RasterShape::new(self.rows, self.cols)
    }

    /// Whether the source needs conversion to float32 on import.
    pub fn needs_conversion(&self) -> bool {
        self.source_dtype.to_lowercase() != DataType::Float32.as_str()
    }
}

/// Identifies one readable raster: where it lives, which reader decodes it,
/// and its header information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub path: PathBuf,
    /// Reader tag ("geotiff", "netcdf", "flat", ...).
    pub format: String,
    pub signature: SourceSignature,
    pub band: Option<u32>,
    pub info: RasterInfo,
}

impl SourceDescriptor {
    /// Cache key of the raw (level 0) array read from this source.
    pub fn source_key(&self) -> CacheKey {
        CacheKey::for_source(
            &self.path,
            &self.signature.as_key_string(),
            &self.format,
            self.band,
        )
    }

    pub fn display_name(&self) -> &str {
        &self.info.dataset_name
    }
}
