//! In-flight references to cache entries.

use crate::CacheStore;
use sift_common::CacheKey;
use std::sync::Arc;

/// RAII reference held by an in-flight job.
///
/// While a lease is alive, eviction skips its keys (whether or not they are
/// stored yet). Dropping the lease runs any eviction that was deferred
/// because of it.
#[must_use = "dropping a lease releases its keys immediately"]
pub struct EntryLease {
    store: Arc<CacheStore>,
    keys: Vec<CacheKey>,
}

impl EntryLease {
    pub(crate) fn new(store: Arc<CacheStore>, keys: Vec<CacheKey>) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &[CacheKey] {
        &self.keys
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        if let Some(target) = self.store.release(&self.keys) {
            self.store.evict_to_quota(target);
        }
    }
}

impl std::fmt::Debug for EntryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLease").field("keys", &self.keys).finish()
    }
}
