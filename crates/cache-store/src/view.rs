//! Zero-copy views over stored entries.

use crate::CacheEntry;
use memmap2::Mmap;
use sift_common::raster::f32_view;
use sift_common::{CacheKey, DataType, PixelWindow};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Backing bytes of a view.
#[derive(Clone)]
pub(crate) enum ByteSource {
    Mapped(Arc<Mmap>),
    /// Zero-length entries cannot be mapped.
    Empty,
}

/// A read-only, memory-mapped view of a cache entry.
///
/// Views never own storage. When the store evicts the entry, `is_valid`
/// turns false; the mapped bytes stay readable until the last view drops,
/// but consumers must treat an invalid view as gone.
#[derive(Clone)]
pub struct EntryView {
    entry: CacheEntry,
    bytes: ByteSource,
    valid: Arc<AtomicBool>,
}

impl EntryView {
    pub(crate) fn new(entry: CacheEntry, bytes: ByteSource, valid: Arc<AtomicBool>) -> Self {
        Self {
            entry,
            bytes,
            valid,
        }
    }

    /// Entry metadata as of the time the view was taken.
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn key(&self) -> CacheKey {
        self.entry.key
    }

    /// Whether the owning entry is still present in the store.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Raw bytes of the stored array.
    pub fn bytes(&self) -> &[u8] {
        match &self.bytes {
            ByteSource::Mapped(map) => &map[..],
            ByteSource::Empty => &[],
        }
    }

    /// Stored values as `f32`, borrowed from the mapping where possible.
    pub fn as_f32(&self) -> Option<Cow<'_, [f32]>> {
        match self.entry.dtype {
            DataType::Float32 => Some(f32_view(self.bytes())),
            DataType::Uint8 => None,
        }
    }

    /// Row slices of a pixel window, each borrowed from the mapping.
    ///
    /// Rows of a window are not contiguous in the row-major entry, so the
    /// window is exposed as one byte slice per row.
    pub fn window_rows(&self, window: &PixelWindow) -> Vec<&[u8]> {
        let shape = self.entry.shape;
        let pixel_bytes = shape.channels * self.entry.dtype.size_of();
        let row_bytes = shape.cols * pixel_bytes;
        let bytes = self.bytes();

        let row_end = window.row_end().min(shape.rows);
        let col_end = window.col_end().min(shape.cols);
        if window.row >= row_end || window.col >= col_end {
            return Vec::new();
        }

        (window.row..row_end)
            .map(|row| {
                let start = row * row_bytes + window.col * pixel_bytes;
                let end = row * row_bytes + col_end * pixel_bytes;
                &bytes[start..end]
            })
            .collect()
    }

    /// Copy a pixel window into one contiguous row-major buffer.
    pub fn copy_window(&self, window: &PixelWindow) -> Vec<u8> {
        self.window_rows(window).concat()
    }
}

impl std::fmt::Debug for EntryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryView")
            .field("key", &self.entry.key)
            .field("shape", &self.entry.shape)
            .field("dtype", &self.entry.dtype)
            .field("valid", &self.is_valid())
            .finish()
    }
}
