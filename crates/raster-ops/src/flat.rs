//! Flat binary rasters: raw little-endian `f32` plus a JSON header sidecar.
//!
//! `scene.f32` holds `bands * rows * cols` values, band-sequential and
//! row-major. `scene.f32.json` holds a [`FlatHeader`].

use crate::reader::{has_extension, RasterReader};
use serde::{Deserialize, Serialize};
use sift_common::{DataType, GeoTransform, RasterInfo, Result, SiftError};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Header sidecar of a flat binary raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatHeader {
    pub rows: usize,
    pub cols: usize,
    pub geotransform: GeoTransform,
    #[serde(default)]
    pub no_data: Option<f32>,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default = "one")]
    pub bands: usize,
    #[serde(default = "one")]
    pub block_height: usize,
}

fn one() -> usize {
    1
}

impl FlatHeader {
    pub fn new(rows: usize, cols: usize, geotransform: GeoTransform) -> Self {
        Self {
            rows,
            cols,
            geotransform,
            no_data: None,
            dataset_name: None,
            bands: 1,
            block_height: 1,
        }
    }

    pub fn with_no_data(mut self, no_data: f32) -> Self {
        self.no_data = Some(no_data);
        self
    }
}

/// Path of the header sidecar for a data file.
pub fn header_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

/// Write a flat raster and its header.
pub fn write_flat(path: &Path, header: &FlatHeader, data: &[f32]) -> Result<()> {
    let expected = header.bands * header.rows * header.cols;
    if data.len() != expected {
        return Err(SiftError::source_read(format!(
            "flat raster needs {} values, got {}",
            expected,
            data.len()
        )));
    }

    let mut out = BufWriter::new(File::create(path)?);
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;

    std::fs::write(header_path(path), serde_json::to_vec_pretty(header)?)?;
    Ok(())
}

/// Reader for flat binary rasters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatBinaryReader;

impl FlatBinaryReader {
    pub const FORMAT: &'static str = "flat";

    fn header(path: &Path) -> Result<FlatHeader> {
        let sidecar = header_path(path);
        let bytes = std::fs::read(&sidecar).map_err(|e| {
            SiftError::source_read(format!("cannot read header {}: {}", sidecar.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SiftError::source_read(format!("invalid header {}: {}", sidecar.display(), e))
        })
    }
}

impl RasterReader for FlatBinaryReader {
    fn format(&self) -> &str {
        Self::FORMAT
    }

    fn is_relevant(&self, path: &Path) -> bool {
        has_extension(path, &["f32"])
    }

    fn describe(&self, path: &Path) -> Result<RasterInfo> {
        let header = Self::header(path)?;
        let dataset_name = header.dataset_name.clone().unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        Ok(RasterInfo {
            rows: header.rows,
            cols: header.cols,
            geotransform: header.geotransform,
            no_data: header.no_data,
            dataset_name,
            source_dtype: DataType::Float32.as_str().to_string(),
            block_height: header.block_height.max(1),
        })
    }

    fn read_rows(
        &self,
        path: &Path,
        info: &RasterInfo,
        band: Option<u32>,
        start_row: usize,
        rows: usize,
    ) -> Result<Vec<f32>> {
        let band = band.unwrap_or(0) as usize;
        let header = Self::header(path)?;
        if band >= header.bands {
            return Err(SiftError::source_read(format!(
                "{} has {} band(s), band {} requested",
                path.display(),
                header.bands,
                band
            )));
        }
        if start_row + rows > info.rows {
            return Err(SiftError::source_read(format!(
                "rows {}..{} out of range for {} rows",
                start_row,
                start_row + rows,
                info.rows
            )));
        }

        let value_offset = (band * info.rows + start_row) * info.cols;
        let mut bytes = vec![0u8; rows * info.cols * 4];

        let read = File::open(path).and_then(|mut file| {
            file.seek(SeekFrom::Start(value_offset as u64 * 4))?;
            file.read_exact(&mut bytes)
        });
        read.map_err(|e| {
            SiftError::source_read(format!("failed to read {}: {}", path.display(), e))
        })?;

        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> PathBuf {
        let path = dir.join("scene.f32");
        let mut header = FlatHeader::new(3, 2, GeoTransform::north_up(0.0, 3.0, 1.0, "EPSG:4326"))
            .with_no_data(-1.0);
        header.bands = 2;
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        write_flat(&path, &header, &data).unwrap();
        path
    }

    #[test]
    fn test_describe_reads_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path());
        let info = FlatBinaryReader.describe(&path).unwrap();

        assert_eq!((info.rows, info.cols), (3, 2));
        assert_eq!(info.no_data, Some(-1.0));
        assert_eq!(info.dataset_name, "scene.f32");
        assert!(!info.needs_conversion());
    }

    #[test]
    fn test_read_rows_and_bands() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample(dir.path());
        let info = FlatBinaryReader.describe(&path).unwrap();

        assert_eq!(FlatBinaryReader.read_rows(&path, &info, None, 1, 2).unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(FlatBinaryReader.read(&path, &info, Some(1)).unwrap(), vec![6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert!(FlatBinaryReader.read(&path, &info, Some(2)).is_err());
        assert!(FlatBinaryReader.read_rows(&path, &info, None, 2, 2).is_err());
    }

    #[test]
    fn test_missing_header_is_source_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan.f32");
        std::fs::write(&path, [0u8; 4]).unwrap();
        assert!(matches!(
            FlatBinaryReader.describe(&path),
            Err(SiftError::SourceRead(_))
        ));
    }

    #[test]
    fn test_write_flat_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let header = FlatHeader::new(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0, "EPSG:4326"));
        assert!(write_flat(&dir.path().join("bad.f32"), &header, &[1.0]).is_err());
    }
}
