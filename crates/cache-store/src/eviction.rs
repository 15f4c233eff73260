//! Victim selection for quota eviction.
//!
//! Selection is a pure function over a snapshot of candidates so the store
//! only holds its lock while deciding, never while deleting files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sift_common::CacheKey;

/// An entry eligible for eviction (not pinned, not leased).
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub key: CacheKey,
    pub last_access: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Outcome of victim selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub victims: Vec<CacheKey>,
    pub bytes: u64,
    /// Whether the victims free at least the requested amount.
    pub sufficient: bool,
}

/// Pick least-recently-used candidates until `bytes_to_free` is reached.
///
/// Ties on access time evict the larger entry first.
pub fn select_victims(mut candidates: Vec<Candidate>, bytes_to_free: u64) -> Selection {
    if bytes_to_free == 0 {
        return Selection {
            sufficient: true,
            ..Selection::default()
        };
    }

    candidates.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then_with(|| b.size_bytes.cmp(&a.size_bytes))
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut selection = Selection::default();
    for candidate in candidates {
        if selection.bytes >= bytes_to_free {
            break;
        }
        selection.bytes += candidate.size_bytes;
        selection.victims.push(candidate.key);
    }
    selection.sufficient = selection.bytes >= bytes_to_free;
    selection
}

/// Summary of one `evict_to_quota` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
    /// Entries that would have been chosen but are referenced by in-flight jobs.
    pub skipped_leased: usize,
    pub skipped_pinned: usize,
    /// Store size after the pass.
    pub remaining_bytes: u64,
    /// Whether the target was reached.
    pub target_met: bool,
}
