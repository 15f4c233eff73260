//! The on-disk cache store.

use crate::entry::{content_digest, MetadataRecord};
use crate::eviction::{select_victims, Candidate, EvictionReport};
use crate::index::{self, IndexLoad};
use crate::layout::{remove_if_exists, StoreLayout};
use crate::stats::{CacheStoreStats, StoreCounters};
use crate::view::ByteSource;
use crate::{CacheConfig, CacheEntry, EntryLease, EntryMetadata, EntryView};
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use sift_common::{CacheKey, RasterArray, Result, SiftError};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Content-addressed, quota-bounded store of array blocks.
///
/// The store exclusively owns entry lifecycle. Other components refer to
/// entries by [`CacheKey`] and read them through [`EntryView`]s.
///
/// Locking: `state` guards bookkeeping only. File writes, renames and
/// deletions happen outside it so slow disks do not block other callers.
pub struct CacheStore {
    config: CacheConfig,
    layout: StoreLayout,
    state: Mutex<StoreState>,
    /// Signalled whenever a key leaves the `writing` set.
    write_done: Condvar,
    /// Serializes index snapshots so a newer snapshot is never overwritten
    /// by an older one.
    index_lock: Mutex<()>,
    counters: StoreCounters,
}

struct Slot {
    entry: CacheEntry,
    valid: Arc<AtomicBool>,
}

struct StoreState {
    slots: HashMap<CacheKey, Slot>,
    used_bytes: u64,
    /// Space promised to writes that are between reservation and publish.
    reserved_bytes: u64,
    pins: HashMap<CacheKey, usize>,
    leases: HashMap<CacheKey, usize>,
    writing: HashSet<CacheKey>,
    /// Eviction target that could not be met because of leased entries.
    deferred_target: Option<u64>,
    maps: LruCache<CacheKey, Arc<Mmap>>,
    last_stamp: DateTime<Utc>,
    dirty: bool,
    /// When `index.json` was last written by this process.
    persisted_at: Option<Instant>,
}

impl StoreState {
    /// Strictly increasing timestamp, so access order is never ambiguous
    /// within one process.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + Duration::nanoseconds(1)
        };
        self.last_stamp = stamp;
        stamp
    }

    /// Entries that may be evicted, plus counts of pinned and leased ones.
    fn eligible(&self) -> (Vec<Candidate>, usize, usize) {
        let mut pinned = 0;
        let mut leased = 0;
        let mut candidates = Vec::with_capacity(self.slots.len());
        for (key, slot) in &self.slots {
            if self.pins.contains_key(key) {
                pinned += 1;
            } else if self.leases.contains_key(key) {
                leased += 1;
            } else {
                candidates.push(Candidate {
                    key: *key,
                    last_access: slot.entry.last_access,
                    size_bytes: slot.entry.size_bytes,
                });
            }
        }
        (candidates, pinned, leased)
    }

    /// Unlink an entry from the index and invalidate its views.
    fn remove_slot(&mut self, key: &CacheKey) -> Option<u64> {
        let slot = self.slots.remove(key)?;
        slot.valid.store(false, Ordering::Release);
        self.maps.pop(key);
        self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size_bytes);
        self.dirty = true;
        Some(slot.entry.size_bytes)
    }
}

/// Removes a key from the `writing` set when a put finishes, however it ends.
struct WriteClaim<'a> {
    store: &'a CacheStore,
    key: CacheKey,
}

impl Drop for WriteClaim<'_> {
    fn drop(&mut self) {
        let mut state = self.store.state.lock();
        state.writing.remove(&self.key);
        self.store.write_done.notify_all();
    }
}

impl CacheStore {
    /// Open (or create) a store, recovering the index from the metadata
    /// records when it is missing or corrupt.
    pub fn open(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate().map_err(SiftError::config)?;
        let layout = StoreLayout::new(&config.root);

        let stale = layout.prepare()?;
        if stale > 0 {
            info!(removed = stale, "Removed staging files from interrupted writes");
        }

        let (entries, needs_flush) = Self::recover_entries(&layout)?;
        let used_bytes = entries.iter().map(|e| e.size_bytes).sum();
        let last_stamp = entries
            .iter()
            .map(|e| e.last_access)
            .max()
            .unwrap_or_else(Utc::now);

        let capacity = NonZeroUsize::new(config.max_open_maps).unwrap_or(NonZeroUsize::MIN);
        let slots = entries
            .into_iter()
            .map(|entry| {
                let slot = Slot {
                    entry,
                    valid: Arc::new(AtomicBool::new(true)),
                };
                (slot.entry.key, slot)
            })
            .collect::<HashMap<_, _>>();

        info!(
            root = %config.root.display(),
            entries = slots.len(),
            used_bytes,
            quota_bytes = config.quota_bytes,
            "Opened cache store"
        );

        let store = Arc::new(Self {
            layout,
            state: Mutex::new(StoreState {
                slots,
                used_bytes,
                reserved_bytes: 0,
                pins: HashMap::new(),
                leases: HashMap::new(),
                writing: HashSet::new(),
                deferred_target: None,
                maps: LruCache::new(capacity),
                last_stamp,
                dirty: needs_flush,
                persisted_at: None,
            }),
            write_done: Condvar::new(),
            index_lock: Mutex::new(()),
            counters: StoreCounters::default(),
            config,
        });

        if store.used_bytes() > store.config.quota_bytes {
            warn!(
                used_bytes = store.used_bytes(),
                quota_bytes = store.config.quota_bytes,
                "Store exceeds quota on open, evicting"
            );
            store.evict_to_quota(store.config.quota_bytes);
        }

        if needs_flush {
            store.flush()?;
        }
        Ok(store)
    }

    /// Discard the persisted index and rebuild it from the entry files.
    pub fn rebuild(config: CacheConfig) -> Result<Arc<Self>> {
        let layout = StoreLayout::new(&config.root);
        remove_if_exists(&layout.index_path())?;
        Self::open(config)
    }

    fn recover_entries(layout: &StoreLayout) -> Result<(Vec<CacheEntry>, bool)> {
        match index::load(&layout.index_path()) {
            IndexLoad::Loaded(entries) => {
                let indexed = entries.len();
                let scanned = index::scan(layout)?;
                if scanned.dropped > 0 || scanned.orphans_removed > 0 {
                    warn!(
                        dropped = scanned.dropped,
                        orphans_removed = scanned.orphans_removed,
                        "Removed damaged entry files"
                    );
                }

                // Keep the index's access times; the records only carry
                // the time of the original put.
                let known: HashMap<CacheKey, DateTime<Utc>> = entries
                    .into_iter()
                    .map(|e| (e.key, e.last_access))
                    .collect();
                let mut changed = scanned.entries.len() != indexed;
                let merged = scanned
                    .entries
                    .into_iter()
                    .map(|mut entry| {
                        match known.get(&entry.key) {
                            Some(access) => entry.last_access = *access,
                            None => changed = true,
                        }
                        entry
                    })
                    .collect::<Vec<_>>();
                if changed {
                    info!(indexed, recovered = merged.len(), "Reconciled index with entry files");
                }
                Ok((merged, changed))
            }
            IndexLoad::Missing => {
                info!("No store index found, rebuilding from entry files");
                let scanned = index::scan(layout)?;
                Ok((scanned.entries, true))
            }
            IndexLoad::Corrupt(reason) => {
                warn!(reason = %reason, "Store index is corrupt, rebuilding from entry files");
                let scanned = index::scan(layout)?;
                Ok((scanned.entries, true))
            }
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store an array under `key`.
    ///
    /// Publishing is atomic: data and metadata are staged in `tmp/` and
    /// renamed into place, and the entry becomes visible to `get` only after
    /// both are on disk. Space is reserved before publishing, evicting LRU
    /// entries if needed, so the store never exceeds its quota.
    pub fn put(
        &self,
        key: CacheKey,
        array: &RasterArray,
        metadata: EntryMetadata,
    ) -> Result<CacheEntry> {
        let bytes = array.as_bytes();
        let digest = content_digest(bytes);
        let size = bytes.len() as u64;

        let claim = {
            let mut state = self.state.lock();
            loop {
                if let Some(slot) = state.slots.get(&key) {
                    return self.resolve_duplicate(&slot.entry, &digest);
                }
                if state.writing.contains(&key) {
                    self.write_done.wait(&mut state);
                    continue;
                }
                state.writing.insert(key);
                break;
            }
            WriteClaim { store: self, key }
        };

        if size > self.config.quota_bytes {
            StoreCounters::bump(&self.counters.quota_rejections);
            return Err(SiftError::QuotaExceeded {
                requested: size,
                quota: self.config.quota_bytes,
                reclaimable: self.used_bytes(),
            });
        }

        let staged = self.layout.stage(bytes, self.config.fsync)?;

        let victims = {
            let mut state = self.state.lock();
            let over = (state.used_bytes + state.reserved_bytes + size)
                .saturating_sub(self.config.quota_bytes);
            let (candidates, pinned, leased) = state.eligible();
            let selection = select_victims(candidates, over);
            if !selection.sufficient {
                StoreCounters::bump(&self.counters.quota_rejections);
                warn!(
                    key = %key.short(),
                    size,
                    pinned,
                    leased,
                    reclaimable = selection.bytes,
                    "Rejecting write, quota cannot be met"
                );
                return Err(SiftError::QuotaExceeded {
                    requested: size,
                    quota: self.config.quota_bytes,
                    reclaimable: selection.bytes,
                });
            }
            let removed: Vec<(CacheKey, u64)> = selection
                .victims
                .iter()
                .filter_map(|k| state.remove_slot(k).map(|size| (*k, size)))
                .collect();
            state.reserved_bytes += size;
            removed
        };
        if !victims.is_empty() {
            debug!(key = %key.short(), victims = victims.len(), "Evicted entries to make room");
            self.delete_files(&victims);
        }

        let now = self.state.lock().next_stamp();
        let entry = CacheEntry {
            key,
            shape: array.shape,
            dtype: array.dtype(),
            geotransform: metadata.geotransform,
            no_data: metadata.no_data.filter(|v| !v.is_nan()),
            label: metadata.label,
            created_at: now,
            last_access: now,
            size_bytes: size,
            content_digest: digest,
            valid: true,
        };

        let published = self.publish(staged, &entry);
        {
            let mut state = self.state.lock();
            state.reserved_bytes = state.reserved_bytes.saturating_sub(size);
            if published.is_ok() {
                state.used_bytes += size;
                state.dirty = true;
                state.slots.insert(
                    key,
                    Slot {
                        entry: entry.clone(),
                        valid: Arc::new(AtomicBool::new(true)),
                    },
                );
            }
        }
        drop(claim);

        if let Err(e) = published {
            error!(key = %key.short(), error = %e, "Failed to publish cache entry");
            return Err(e);
        }

        StoreCounters::bump(&self.counters.puts);
        metrics::counter!("sift_cache_puts_total").increment(1);
        metrics::gauge!("sift_cache_used_bytes").set(self.used_bytes() as f64);
        debug!(key = %key.short(), size, label = ?entry.label, "Stored cache entry");

        self.persist_index_soon();
        Ok(entry)
    }

    fn resolve_duplicate(&self, existing: &CacheEntry, digest: &str) -> Result<CacheEntry> {
        if existing.same_content(digest) {
            StoreCounters::bump(&self.counters.duplicate_puts);
            debug!(key = %existing.key.short(), "Duplicate put with identical content");
            Ok(existing.clone())
        } else {
            error!(
                key = %existing.key,
                stored = %existing.content_digest,
                offered = %digest,
                "Put with different content for an existing key"
            );
            Err(SiftError::integrity(
                existing.key,
                "key already stored with different content",
            ))
        }
    }

    fn publish(&self, staged: NamedTempFile, entry: &CacheEntry) -> Result<()> {
        let record = MetadataRecord::seal(entry.clone())?.to_bytes()?;
        let data_path = self.layout.data_path(&entry.key);
        staged.persist(&data_path).map_err(|e| {
            SiftError::storage(format!("failed to publish {}: {}", data_path.display(), e.error))
        })?;

        let meta_path = self.layout.meta_path(&entry.key);
        if let Err(e) = self.layout.write_atomic(&meta_path, &record, self.config.fsync) {
            let _ = remove_if_exists(&data_path);
            return Err(e);
        }
        Ok(())
    }

    /// Memory-mapped view of an entry, or `None` when it is absent.
    ///
    /// Entries whose metadata fails its checksum or whose data file is
    /// missing or truncated are dropped and reported as absent so the caller
    /// rebuilds them.
    pub fn get(&self, key: &CacheKey) -> Result<Option<EntryView>> {
        let (entry, valid, cached) = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get(key) else {
                self.record_miss();
                return Ok(None);
            };
            let entry = slot.entry.clone();
            let valid = slot.valid.clone();
            (entry, valid, state.maps.get(key).cloned())
        };

        let bytes = match cached {
            Some(map) => ByteSource::Mapped(map),
            None => match self.open_bytes(&entry) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(key = %key.short(), error = %e, "Dropping unreadable cache entry");
                    StoreCounters::bump(&self.counters.integrity_drops);
                    metrics::counter!("sift_cache_integrity_drops_total").increment(1);
                    self.drop_entry(key, &valid);
                    self.record_miss();
                    return Ok(None);
                }
            },
        };

        let touched = {
            let mut state = self.state.lock();
            let stamp = state.next_stamp();
            let touched = match state.slots.get_mut(key) {
                Some(slot) if Arc::ptr_eq(&slot.valid, &valid) => {
                    slot.entry.last_access = stamp;
                    Some(slot.entry.clone())
                }
                _ => None,
            };
            if touched.is_some() {
                if let ByteSource::Mapped(map) = &bytes {
                    state.maps.put(*key, map.clone());
                }
                state.dirty = true;
            }
            touched
        };
        // Evicted between the lookup and the touch.
        let Some(entry) = touched else {
            self.record_miss();
            return Ok(None);
        };

        StoreCounters::bump(&self.counters.hits);
        metrics::counter!("sift_cache_hits_total").increment(1);
        Ok(Some(EntryView::new(entry, bytes, valid)))
    }

    fn record_miss(&self) {
        StoreCounters::bump(&self.counters.misses);
        metrics::counter!("sift_cache_misses_total").increment(1);
    }

    /// Verify the metadata record and map the data file.
    fn open_bytes(&self, entry: &CacheEntry) -> Result<ByteSource> {
        let meta = std::fs::read(self.layout.meta_path(&entry.key))?;
        let record = MetadataRecord::parse(&meta)?;
        if record.entry.key != entry.key
            || record.entry.size_bytes != entry.size_bytes
            || record.entry.content_digest != entry.content_digest
        {
            return Err(SiftError::integrity(
                entry.key,
                "metadata record does not match index",
            ));
        }

        if entry.size_bytes == 0 {
            return Ok(ByteSource::Empty);
        }

        let file = std::fs::File::open(self.layout.data_path(&entry.key))?;
        let len = file.metadata()?.len();
        if len != entry.size_bytes {
            return Err(SiftError::integrity(
                entry.key,
                format!("data file is {} bytes, expected {}", len, entry.size_bytes),
            ));
        }

        // SAFETY: data files are written once via rename and never modified
        // in place; eviction unlinks them, which leaves existing mappings
        // intact.
        let map = unsafe { Mmap::map(&file)? };
        Ok(ByteSource::Mapped(Arc::new(map)))
    }

    fn drop_entry(&self, key: &CacheKey, valid: &Arc<AtomicBool>) {
        let removed = {
            let mut state = self.state.lock();
            match state.slots.get(key) {
                Some(slot) if Arc::ptr_eq(&slot.valid, valid) => state.remove_slot(key),
                _ => None,
            }
        };
        if removed.is_some() {
            let _ = remove_if_exists(&self.layout.data_path(key));
            let _ = remove_if_exists(&self.layout.meta_path(key));
            self.persist_index_soon();
        }
    }

    /// Existence check that does not touch the access time.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    /// Entry metadata without touching the access time.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().slots.get(key).map(|s| s.entry.clone())
    }

    /// All entries, least recently used first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .state
            .lock()
            .slots
            .values()
            .map(|s| s.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.last_access.cmp(&b.last_access));
        entries
    }

    /// Mark a key ineligible for eviction. Pins are counted; each `pin`
    /// needs a matching `unpin`. Keys may be pinned before they are stored.
    ///
    /// Returns whether the key is currently stored.
    pub fn pin(&self, key: &CacheKey) -> bool {
        let mut state = self.state.lock();
        *state.pins.entry(*key).or_insert(0) += 1;
        state.slots.contains_key(key)
    }

    /// Release one pin. Returns false if the key was not pinned.
    pub fn unpin(&self, key: &CacheKey) -> bool {
        let mut state = self.state.lock();
        match state.pins.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                state.pins.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.state.lock().pins.contains_key(key)
    }

    /// Reference a set of keys for the duration of a job. Referenced
    /// entries are skipped by eviction until the lease drops.
    pub fn lease(self: &Arc<Self>, keys: impl IntoIterator<Item = CacheKey>) -> EntryLease {
        let mut keys: Vec<CacheKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut state = self.state.lock();
        for key in &keys {
            *state.leases.entry(*key).or_insert(0) += 1;
        }
        drop(state);

        EntryLease::new(Arc::clone(self), keys)
    }

    /// Release leased keys. Returns a deferred eviction target if the
    /// release made previously skipped entries eligible.
    pub(crate) fn release(&self, keys: &[CacheKey]) -> Option<u64> {
        let mut state = self.state.lock();
        let mut freed_any = false;
        for key in keys {
            if let Some(count) = state.leases.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    state.leases.remove(key);
                    freed_any = true;
                }
            }
        }
        if freed_any {
            state.deferred_target
        } else {
            None
        }
    }

    pub fn is_leased(&self, key: &CacheKey) -> bool {
        self.state.lock().leases.contains_key(key)
    }

    /// Evict least-recently-used, unpinned, unleased entries until the store
    /// holds at most `target_bytes`.
    ///
    /// If leased entries prevent reaching the target, the pass is retried
    /// automatically when their leases are released.
    pub fn evict_to_quota(&self, target_bytes: u64) -> EvictionReport {
        let (removed, mut report) = {
            let mut state = self.state.lock();
            state.deferred_target = None;

            let over = state.used_bytes.saturating_sub(target_bytes);
            let (candidates, pinned, leased) = state.eligible();
            let selection = select_victims(candidates, over);

            let removed: Vec<(CacheKey, u64)> = selection
                .victims
                .iter()
                .filter_map(|k| state.remove_slot(k).map(|size| (*k, size)))
                .collect();

            let target_met = state.used_bytes <= target_bytes;
            if !target_met && leased > 0 {
                state.deferred_target = Some(target_bytes);
            }

            let report = EvictionReport {
                entries_removed: removed.len(),
                bytes_freed: removed.iter().map(|(_, size)| size).sum(),
                skipped_leased: if target_met { 0 } else { leased },
                skipped_pinned: if target_met { 0 } else { pinned },
                remaining_bytes: state.used_bytes,
                target_met,
            };
            (removed, report)
        };

        if !removed.is_empty() {
            self.delete_files(&removed);
            self.persist_index_soon();
        }

        if report.entries_removed > 0 || !report.target_met {
            info!(
                entries_evicted = report.entries_removed,
                bytes_freed = report.bytes_freed,
                remaining_bytes = report.remaining_bytes,
                target_bytes,
                skipped_leased = report.skipped_leased,
                skipped_pinned = report.skipped_pinned,
                "Cache eviction completed"
            );
        }
        report.remaining_bytes = self.used_bytes();
        report
    }

    fn delete_files(&self, removed: &[(CacheKey, u64)]) {
        for (key, size) in removed {
            for path in [self.layout.data_path(key), self.layout.meta_path(key)] {
                if let Err(e) = remove_if_exists(&path) {
                    warn!(file = %path.display(), error = %e, "Failed to delete evicted file");
                }
            }
            StoreCounters::bump(&self.counters.evictions);
            StoreCounters::add(&self.counters.bytes_evicted, *size);
        }
        metrics::counter!("sift_cache_evictions_total").increment(removed.len() as u64);
        metrics::gauge!("sift_cache_used_bytes").set(self.used_bytes() as f64);
    }

    /// Total bytes of stored entries.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStoreStats {
        let mut stats = {
            let state = self.state.lock();
            CacheStoreStats {
                entries: state.slots.len(),
                used_bytes: state.used_bytes,
                quota_bytes: self.config.quota_bytes,
                pinned_entries: state.pins.len(),
                leased_entries: state.leases.len(),
                ..CacheStoreStats::default()
            }
        };
        self.counters.snapshot(&mut stats);
        stats
    }

    /// Persist the index (including updated access times).
    pub fn flush(&self) -> Result<()> {
        self.persist_index()
    }

    /// Write the index if it is dirty and the last write is older than
    /// `index_flush_interval_ms`. Otherwise it stays dirty for the next
    /// mutation, `flush` or close to pick up; `open` reconciles a stale
    /// index against the metadata records, so a missed write loses at
    /// most access-time ordering.
    fn persist_index_soon(&self) {
        let interval = std::time::Duration::from_millis(self.config.index_flush_interval_ms);
        {
            let state = self.state.lock();
            if !state.dirty {
                return;
            }
            if state.persisted_at.is_some_and(|at| at.elapsed() < interval) {
                StoreCounters::bump(&self.counters.index_writes_deferred);
                return;
            }
        }
        if let Err(e) = self.persist_index() {
            warn!(error = %e, "Failed to persist store index");
        }
    }

    fn persist_index(&self) -> Result<()> {
        let _guard = self.index_lock.lock();
        let entries = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.persisted_at = Some(Instant::now());
            state
                .slots
                .values()
                .map(|s| s.entry.clone())
                .collect::<Vec<_>>()
        };
        let result = index::save(&self.layout, entries, self.config.fsync);
        if result.is_ok() {
            StoreCounters::bump(&self.counters.index_writes);
        } else {
            self.state.lock().dirty = true;
        }
        result
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if self.state.get_mut().dirty {
            if let Err(e) = self.persist_index() {
                warn!(error = %e, "Failed to persist store index on close");
            }
        }
    }
}
