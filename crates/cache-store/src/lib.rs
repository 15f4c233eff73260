//! Content-addressed, quota-bounded on-disk cache of array blocks.
//!
//! Every intermediate product (source reads, pyramid levels, derived
//! products) lives here under a [`CacheKey`](sift_common::CacheKey). The
//! store owns entry lifecycle; everyone else borrows through views.
//!
//! ```text
//!   put(key, array) ──► tmp/ (stage) ──reserve quota──► entries/<key>.data
//!                                                        entries/<key>.meta.json
//!                                                        index.json
//!
//!   get(key) ──► verify record ──► mmap ──► EntryView (zero-copy)
//!
//!   evict_to_quota ──► LRU over entries that are neither pinned nor leased
//! ```

mod config;
mod entry;
mod eviction;
mod index;
mod layout;
mod lease;
mod stats;
mod store;
mod view;

pub use config::CacheConfig;
pub use entry::{content_digest, CacheEntry, EntryMetadata, MetadataRecord};
pub use eviction::EvictionReport;
pub use lease::EntryLease;
pub use stats::CacheStoreStats;
pub use store::CacheStore;
pub use view::EntryView;
