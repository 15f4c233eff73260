//! Persisted store-wide index and its recovery by directory scan.

use crate::entry::MetadataRecord;
use crate::layout::{remove_if_exists, StoreLayout, DATA_SUFFIX, META_SUFFIX};
use crate::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_common::{CacheKey, Result, SiftError};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    written_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
    checksum: u32,
}

/// Result of reading `index.json`.
#[derive(Debug)]
pub(crate) enum IndexLoad {
    Loaded(Vec<CacheEntry>),
    Missing,
    Corrupt(String),
}

pub(crate) fn load(path: &Path) -> IndexLoad {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return IndexLoad::Missing,
        Err(e) => return IndexLoad::Corrupt(e.to_string()),
    };

    let file: IndexFile = match serde_json::from_slice(&bytes) {
        Ok(file) => file,
        Err(e) => return IndexLoad::Corrupt(e.to_string()),
    };

    if file.version != INDEX_VERSION {
        return IndexLoad::Corrupt(format!("unsupported index version {}", file.version));
    }

    match checksum(&file.entries) {
        Ok(sum) if sum == file.checksum => IndexLoad::Loaded(file.entries),
        Ok(sum) => IndexLoad::Corrupt(format!(
            "index checksum mismatch (stored {:08x}, computed {:08x})",
            file.checksum, sum
        )),
        Err(e) => IndexLoad::Corrupt(e.to_string()),
    }
}

pub(crate) fn save(layout: &StoreLayout, entries: Vec<CacheEntry>, fsync: bool) -> Result<()> {
    let file = IndexFile {
        version: INDEX_VERSION,
        written_at: Utc::now(),
        checksum: checksum(&entries)?,
        entries,
    };
    let bytes = serde_json::to_vec(&file)?;
    layout.write_atomic(&layout.index_path(), &bytes, fsync)
}

fn checksum(entries: &[CacheEntry]) -> Result<u32> {
    let encoded = serde_json::to_vec(entries)?;
    Ok(crc32fast::hash(&encoded))
}

/// Check an index row against the files on disk.
pub(crate) fn files_match(layout: &StoreLayout, entry: &CacheEntry) -> bool {
    let data_len = std::fs::metadata(layout.data_path(&entry.key)).map(|m| m.len());
    matches!(data_len, Ok(len) if len == entry.size_bytes) && layout.meta_path(&entry.key).is_file()
}

/// Outcome of rebuilding the index from metadata records.
#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    pub entries: Vec<CacheEntry>,
    /// Records dropped for bad checksums or missing/short data files.
    pub dropped: usize,
    /// Data files with no metadata record, deleted.
    pub orphans_removed: usize,
}

/// Rebuild the index from the metadata records in `entries/`.
pub(crate) fn scan(layout: &StoreLayout) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();
    let mut seen: HashSet<CacheKey> = HashSet::new();
    let mut data_files = Vec::new();

    for item in WalkDir::new(layout.entries_dir()).min_depth(1).max_depth(1) {
        let item = item.map_err(|e| SiftError::storage(e.to_string()))?;
        if !item.file_type().is_file() {
            continue;
        }
        let name = item.file_name().to_string_lossy().to_string();

        if let Some(stem) = name.strip_suffix(DATA_SUFFIX) {
            data_files.push((stem.to_string(), item.path().to_path_buf()));
            continue;
        }

        let Some(stem) = name.strip_suffix(META_SUFFIX) else {
            continue;
        };

        match read_record(item.path(), stem) {
            Ok(record) if files_match(layout, &record.entry) => {
                seen.insert(record.entry.key);
                outcome.entries.push(record.entry);
            }
            Ok(record) => {
                warn!(key = %record.entry.key, "Dropping entry whose data file is missing or truncated");
                drop_files(layout, &record.entry.key);
                outcome.dropped += 1;
            }
            Err(e) => {
                warn!(file = %item.path().display(), error = %e, "Dropping unreadable metadata record");
                let _ = remove_if_exists(item.path());
                if let Ok(key) = CacheKey::from_hex(stem) {
                    let _ = remove_if_exists(&layout.data_path(&key));
                }
                outcome.dropped += 1;
            }
        }
    }

    for (stem, path) in data_files {
        let known = CacheKey::from_hex(&stem).is_ok_and(|key| seen.contains(&key));
        if !known {
            debug!(file = %path.display(), "Removing orphan data file");
            if remove_if_exists(&path).is_ok() {
                outcome.orphans_removed += 1;
            }
        }
    }

    Ok(outcome)
}

fn read_record(path: &Path, stem: &str) -> Result<MetadataRecord> {
    let bytes = std::fs::read(path)?;
    let record = MetadataRecord::parse(&bytes)?;
    if record.entry.key.to_hex() != stem {
        return Err(SiftError::integrity(
            record.entry.key,
            format!("metadata record stored under foreign name {}", stem),
        ));
    }
    Ok(record)
}

fn drop_files(layout: &StoreLayout, key: &CacheKey) {
    let _ = remove_if_exists(&layout.data_path(key));
    let _ = remove_if_exists(&layout.meta_path(key));
}
