//! Priority queue of tiles waiting for a worker.

use crate::product::ResolvedProduct;
use sift_common::TileCoord;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// A tile waiting for a worker slot.
#[derive(Debug, Clone)]
pub(crate) struct QueuedTile {
    pub epoch: u64,
    pub coord: TileCoord,
    /// Level already cached when queued.
    pub cached: bool,
    /// Distance from the tile center to the viewport center, in world units.
    pub distance: f64,
    /// Insertion order for FIFO among otherwise equal tiles.
    pub sequence: u64,
    pub product: Arc<ResolvedProduct>,
}

impl PartialEq for QueuedTile {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTile {}

impl PartialOrd for QueuedTile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTile {
    /// Greater pops first: cached levels, then finer levels, then tiles
    /// nearer the viewport center, then older entries.
    fn cmp(&self, other: &Self) -> Ordering {
        self.cached
            .cmp(&other.cached)
            .then_with(|| other.coord.level.cmp(&self.coord.level))
            .then_with(|| other.distance.total_cmp(&self.distance))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TileQueue {
    heap: BinaryHeap<QueuedTile>,
    sequence: u64,
}

impl TileQueue {
    pub fn push(
        &mut self,
        epoch: u64,
        coord: TileCoord,
        cached: bool,
        distance: f64,
        product: Arc<ResolvedProduct>,
    ) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.heap.push(QueuedTile {
            epoch,
            coord,
            cached,
            distance,
            sequence,
            product,
        });
    }

    pub fn pop(&mut self) -> Option<QueuedTile> {
        self.heap.pop()
    }

    /// Remove every waiting tile.
    pub fn drain(&mut self) -> Vec<QueuedTile> {
        self.heap.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn product() -> Arc<ResolvedProduct> {
        Arc::new(ResolvedProduct {
            label: "test".to_string(),
            time: Utc::now(),
            sources: Vec::new(),
            recipe: None,
        })
    }

    fn order(queue: &mut TileQueue) -> Vec<TileCoord> {
        std::iter::from_fn(|| queue.pop()).map(|t| t.coord).collect()
    }

    #[test]
    fn test_cached_before_uncached() {
        let mut queue = TileQueue::default();
        let p = product();
        queue.push(1, TileCoord::new(0, 0, 0), false, 0.0, p.clone());
        queue.push(1, TileCoord::new(3, 0, 0), true, 10.0, p);

        assert_eq!(order(&mut queue), vec![TileCoord::new(3, 0, 0), TileCoord::new(0, 0, 0)]);
    }

    #[test]
    fn test_finer_level_then_distance() {
        let mut queue = TileQueue::default();
        let p = product();
        queue.push(1, TileCoord::new(2, 0, 0), false, 0.0, p.clone());
        queue.push(1, TileCoord::new(1, 0, 1), false, 5.0, p.clone());
        queue.push(1, TileCoord::new(1, 0, 0), false, 1.0, p);

        assert_eq!(
            order(&mut queue),
            vec![
                TileCoord::new(1, 0, 0),
                TileCoord::new(1, 0, 1),
                TileCoord::new(2, 0, 0)
            ]
        );
    }

    #[test]
    fn test_fifo_among_equals() {
        let mut queue = TileQueue::default();
        let p = product();
        for col in 0..4 {
            queue.push(1, TileCoord::new(0, 0, col), false, 2.0, p.clone());
        }
        let cols: Vec<u32> = order(&mut queue).iter().map(|c| c.col).collect();
        assert_eq!(cols, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = TileQueue::default();
        queue.push(1, TileCoord::new(0, 0, 0), false, 0.0, product());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
