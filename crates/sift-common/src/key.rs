//! Content-addressed cache keys.
//!
//! A [`CacheKey`] is a SHA-256 fingerprint over a domain tag and a sequence
//! of named, length-prefixed fields. Two requests that hash the same fields
//! in the same order always produce the same key.

use crate::SiftError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Deterministic fingerprint identifying cached content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, used as the on-disk file stem.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 64-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, SiftError> {
        let bytes = hex::decode(s)
            .map_err(|e| SiftError::metadata(format!("invalid cache key '{}': {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SiftError::metadata(format!("cache key '{}' is not 32 bytes", s)))?;
        Ok(Self(bytes))
    }

    /// Start a key for the given domain ("source", "level", "recipe", ...).
    pub fn builder(domain: &str) -> KeyBuilder {
        KeyBuilder::new(domain)
    }

    /// Key of a raw source read: path, modification signature and format.
    pub fn for_source(path: &Path, signature: &str, format: &str, band: Option<u32>) -> Self {
        let mut builder = Self::builder("source")
            .field("path", path.to_string_lossy().as_bytes())
            .field("signature", signature)
            .field("format", format);
        if let Some(band) = band {
            builder = builder.field("band", band.to_le_bytes());
        }
        builder.finish()
    }

    /// Key of pyramid level `level` derived from this level-0 key.
    ///
    /// Level 0 is the source key itself.
    pub fn for_level(&self, level: u32, aggregation: &str, factor: u32) -> Self {
        if level == 0 {
            return *self;
        }
        Self::builder("level")
            .field("source", self.0)
            .field("level", level.to_le_bytes())
            .field("aggregation", aggregation)
            .field("factor", factor.to_le_bytes())
            .finish()
    }

    /// Abbreviated hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for CacheKey {
    type Error = SiftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CacheKey::from_hex(&value)
    }
}

/// Incremental builder for [`CacheKey`]s.
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    fn new(domain: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"sift-key-v1\0");
        hasher.update((domain.len() as u64).to_le_bytes());
        hasher.update(domain.as_bytes());
        Self { hasher }
    }

    /// Append a named field. Name and value are length-prefixed so adjacent
    /// fields cannot alias each other.
    pub fn field(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        let value = value.as_ref();
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    /// Append another key as a field.
    pub fn key(self, name: &str, key: &CacheKey) -> Self {
        self.field(name, key.as_bytes())
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_source_key_deterministic() {
        let path = PathBuf::from("/data/HS_H08_B13.tif");
        let a = CacheKey::for_source(&path, "1700000000:1024", "geotiff", None);
        let b = CacheKey::for_source(&path, "1700000000:1024", "geotiff", None);
        assert_eq!(a, b);

        let changed = CacheKey::for_source(&path, "1700000001:1024", "geotiff", None);
        assert_ne!(a, changed);
    }

    #[test]
    fn test_level_zero_is_source() {
        let key = CacheKey::builder("source").field("path", "x").finish();
        assert_eq!(key.for_level(0, "mean", 2), key);
        assert_ne!(key.for_level(1, "mean", 2), key);
        assert_ne!(key.for_level(1, "mean", 2), key.for_level(1, "max", 2));
    }

    #[test]
    fn test_fields_do_not_alias() {
        let a = CacheKey::builder("t").field("a", "bc").finish();
        let b = CacheKey::builder("t").field("ab", "c").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip_and_serde() {
        let key = CacheKey::builder("t").field("x", "y").finish();
        assert_eq!(CacheKey::from_hex(&key.to_hex()).unwrap(), key);

        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        assert!(CacheKey::from_hex("abcd").is_err());
    }
}
