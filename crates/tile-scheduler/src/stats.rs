//! Scheduler statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct SchedulerCounters {
    pub viewports: AtomicU64,
    pub tiles_queued: AtomicU64,
    pub tiles_started: AtomicU64,
    pub tiles_ready: AtomicU64,
    pub tiles_failed: AtomicU64,
    pub tiles_timed_out: AtomicU64,
    pub tiles_cancelled: AtomicU64,
    pub tiles_adopted: AtomicU64,
    pub notifications_suppressed: AtomicU64,
    pub active: AtomicUsize,
    pub queued: AtomicUsize,
}

impl SchedulerCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            viewports: self.viewports.load(Ordering::Relaxed),
            tiles_queued: self.tiles_queued.load(Ordering::Relaxed),
            tiles_started: self.tiles_started.load(Ordering::Relaxed),
            tiles_ready: self.tiles_ready.load(Ordering::Relaxed),
            tiles_failed: self.tiles_failed.load(Ordering::Relaxed),
            tiles_timed_out: self.tiles_timed_out.load(Ordering::Relaxed),
            tiles_cancelled: self.tiles_cancelled.load(Ordering::Relaxed),
            tiles_adopted: self.tiles_adopted.load(Ordering::Relaxed),
            notifications_suppressed: self.notifications_suppressed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Viewport requests planned.
    pub viewports: u64,
    pub tiles_queued: u64,
    pub tiles_started: u64,
    pub tiles_ready: u64,
    pub tiles_failed: u64,
    pub tiles_timed_out: u64,
    /// Tiles superseded by a newer viewport (or shutdown) before finishing.
    pub tiles_cancelled: u64,
    /// Re-requested tiles handed to a job already running for them.
    pub tiles_adopted: u64,
    /// Finished tiles whose epoch had already been superseded.
    pub notifications_suppressed: u64,
    /// Jobs currently running.
    pub active: usize,
    /// Tiles currently waiting.
    pub queued: usize,
}

impl SchedulerStats {
    /// Tiles that reached a terminal notification.
    pub fn tiles_delivered(&self) -> u64 {
        self.tiles_ready + self.tiles_failed + self.tiles_timed_out
    }
}
