//! On-disk layout of a store and atomic file publication.
//!
//! ```text
//! <root>/
//!   index.json                 store-wide index (rebuildable)
//!   entries/<hex>.data         raw array bytes
//!   entries/<hex>.meta.json    metadata record with checksum
//!   tmp/                       staging area for atomic publish
//! ```

use sift_common::{CacheKey, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub(crate) const DATA_SUFFIX: &str = ".data";
pub(crate) const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
pub(crate) struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir().join(format!("{}{}", key.to_hex(), DATA_SUFFIX))
    }

    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir().join(format!("{}{}", key.to_hex(), META_SUFFIX))
    }

    /// Create the directory tree and clear leftovers from interrupted writes.
    pub fn prepare(&self) -> Result<usize> {
        std::fs::create_dir_all(self.entries_dir())?;
        let tmp = self.tmp_dir();
        std::fs::create_dir_all(&tmp)?;

        let mut removed = 0;
        for entry in std::fs::read_dir(&tmp)? {
            let path = entry?.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stage `bytes` in the tmp directory. The returned file is deleted on
    /// drop unless persisted.
    pub fn stage(&self, bytes: &[u8], fsync: bool) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new_in(self.tmp_dir())?;
        file.write_all(bytes)?;
        file.flush()?;
        if fsync {
            file.as_file().sync_all()?;
        }
        Ok(file)
    }

    /// Write `bytes` to `dest` via stage-then-rename so readers never
    /// observe a partial file.
    pub fn write_atomic(&self, dest: &Path, bytes: &[u8], fsync: bool) -> Result<()> {
        let staged = self.stage(bytes, fsync)?;
        staged.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
