//! Cache entries and their on-disk metadata records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sift_common::{CacheKey, DataType, GeoTransform, RasterShape, Result, SiftError};

/// Caller-supplied metadata accompanying a `put`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub geotransform: Option<GeoTransform>,
    /// No-data sentinel. NaN is always treated as no-data and is not
    /// recorded here.
    pub no_data: Option<f32>,
    /// Free-form description for logs and tooling.
    pub label: Option<String>,
}

impl EntryMetadata {
    pub fn new(geotransform: Option<GeoTransform>, no_data: Option<f32>) -> Self {
        Self {
            geotransform,
            no_data: no_data.filter(|v| !v.is_nan()),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A stored array: the unit of storage and eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub shape: RasterShape,
    pub dtype: DataType,
    pub geotransform: Option<GeoTransform>,
    pub no_data: Option<f32>,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub size_bytes: u64,
    /// SHA-256 of the array bytes, hex encoded.
    pub content_digest: String,
    pub valid: bool,
}

impl CacheEntry {
    /// Whether `digest` names the same bytes as this entry.
    pub fn same_content(&self, digest: &str) -> bool {
        self.content_digest == digest
    }
}

/// Hex SHA-256 of a byte buffer.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Metadata file contents: the entry plus a CRC32 over its JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub entry: CacheEntry,
    pub checksum: u32,
}

impl MetadataRecord {
    /// Wrap an entry and compute its checksum.
    pub fn seal(entry: CacheEntry) -> Result<Self> {
        let checksum = entry_checksum(&entry)?;
        Ok(Self { entry, checksum })
    }

    /// Parse and verify a record. A checksum mismatch is an integrity error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let record: MetadataRecord = serde_json::from_slice(bytes)?;
        let expected = entry_checksum(&record.entry)?;
        if expected != record.checksum {
            return Err(SiftError::integrity(
                record.entry.key,
                format!(
                    "metadata checksum mismatch (stored {:08x}, computed {:08x})",
                    record.checksum, expected
                ),
            ));
        }
        Ok(record)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

fn entry_checksum(entry: &CacheEntry) -> Result<u32> {
    let encoded = serde_json::to_vec(entry)?;
    Ok(crc32fast::hash(&encoded))
}
