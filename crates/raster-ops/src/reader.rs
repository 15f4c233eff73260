//! Source reader capability.
//!
//! Format decoding lives behind [`RasterReader`]. The cache only needs a
//! cheap header read (`describe`) and row-range reads converted to `f32`.

use crate::flat::FlatBinaryReader;
use sift_common::{Result, SiftError, SourceDescriptor, SourceSignature, RasterInfo};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Decodes one raster file format.
pub trait RasterReader: Send + Sync {
    /// Format tag this reader answers to ("flat", "geotiff", ...).
    fn format(&self) -> &str;

    /// Whether this reader can plausibly open `path`, judged by name only.
    fn is_relevant(&self, path: &Path) -> bool;

    /// Header information, without decoding pixels.
    fn describe(&self, path: &Path) -> Result<RasterInfo>;

    /// Decode `rows` rows starting at `start_row`, converted to `f32`.
    fn read_rows(
        &self,
        path: &Path,
        info: &RasterInfo,
        band: Option<u32>,
        start_row: usize,
        rows: usize,
    ) -> Result<Vec<f32>>;

    /// Decode the whole band.
    fn read(&self, path: &Path, info: &RasterInfo, band: Option<u32>) -> Result<Vec<f32>> {
        self.read_rows(path, info, band, 0, info.rows)
    }
}

/// Well-known format tag for a file extension.
pub fn format_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "tif" | "tiff" => Some("geotiff"),
        "nc" | "nc4" => Some("netcdf"),
        "f32" => Some(FlatBinaryReader::FORMAT),
        _ => None,
    }
}

/// True when `path` has an extension from `extensions` (case-insensitive).
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Dispatches reads to registered readers by format tag, falling back to
/// relevance checks when no tag is given.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    readers: Vec<Arc<dyn RasterReader>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in flat binary reader.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(FlatBinaryReader);
        registry
    }

    /// Register a reader. Later registrations win for the same tag.
    pub fn register(&mut self, reader: impl RasterReader + 'static) {
        self.register_arc(Arc::new(reader));
    }

    pub fn register_arc(&mut self, reader: Arc<dyn RasterReader>) {
        self.readers.insert(0, reader);
    }

    pub fn formats(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.format().to_string()).collect()
    }

    fn by_tag(&self, format: &str) -> Option<Arc<dyn RasterReader>> {
        self.readers
            .iter()
            .find(|r| r.format().eq_ignore_ascii_case(format))
            .cloned()
    }

    /// Reader for a format tag. An empty tag tries the tag implied by the
    /// file extension, then asks each reader whether it recognizes `path`.
    pub fn resolve(&self, format: &str, path: &Path) -> Result<Arc<dyn RasterReader>> {
        if !format.is_empty() {
            return self.by_tag(format).ok_or_else(|| {
                SiftError::source_read(format!(
                    "no reader registered for format '{}' ({})",
                    format,
                    path.display()
                ))
            });
        }

        if let Some(reader) = format_for_path(path).and_then(|tag| self.by_tag(tag)) {
            return Ok(reader);
        }

        self.readers
            .iter()
            .find(|r| r.is_relevant(path))
            .cloned()
            .ok_or_else(|| {
                SiftError::source_read(format!("no reader recognizes {}", path.display()))
            })
    }

    /// Describe a file and capture its signature into a descriptor.
    pub fn descriptor(
        &self,
        path: &Path,
        format: Option<&str>,
        band: Option<u32>,
    ) -> Result<SourceDescriptor> {
        let reader = self.resolve(format.unwrap_or(""), path)?;
        let signature = SourceSignature::from_path(path)?;
        let info = reader.describe(path)?;
        debug!(
            path = %path.display(),
            format = reader.format(),
            rows = info.rows,
            cols = info.cols,
            "Described source"
        );
        Ok(SourceDescriptor {
            path: path.to_path_buf(),
            format: reader.format().to_string(),
            signature,
            band,
            info,
        })
    }
}
