//! Per-epoch tile states.
//!
//! Only the current epoch and the one it superseded are kept, so a renderer
//! can still see which of its old tiles were cancelled.

use crate::event::TileState;
use sift_common::TileCoord;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct EpochStates {
    epoch: u64,
    states: HashMap<TileCoord, TileState>,
}

#[derive(Debug, Default)]
pub(crate) struct Tracker {
    current: EpochStates,
    previous: EpochStates,
}

impl Tracker {
    /// Start a new epoch. Tiles of the outgoing epoch that were still
    /// requested or building become cancelled; returns the new epoch and
    /// how many tiles that was.
    pub fn advance(&mut self) -> (u64, usize) {
        let next = EpochStates {
            epoch: self.current.epoch + 1,
            states: HashMap::new(),
        };
        self.previous = std::mem::replace(&mut self.current, next);

        let mut superseded = 0;
        for state in self.previous.states.values_mut() {
            if !state.is_terminal() {
                *state = TileState::Cancelled;
                superseded += 1;
            }
        }
        (self.current.epoch, superseded)
    }

    pub fn epoch(&self) -> u64 {
        self.current.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.current.epoch == epoch
    }

    fn slot(&mut self, epoch: u64) -> Option<&mut EpochStates> {
        if self.current.epoch == epoch {
            Some(&mut self.current)
        } else if self.previous.epoch == epoch {
            Some(&mut self.previous)
        } else {
            None
        }
    }

    /// Record a state; returns false when the epoch is no longer tracked.
    pub fn set(&mut self, epoch: u64, coord: TileCoord, state: TileState) -> bool {
        match self.slot(epoch) {
            Some(slot) => {
                slot.states.insert(coord, state);
                true
            }
            None => false,
        }
    }

    /// Cancel a tile that has not finished. Returns true when the state
    /// changed.
    pub fn cancel(&mut self, epoch: u64, coord: &TileCoord) -> bool {
        let Some(state) = self.slot(epoch).and_then(|s| s.states.get_mut(coord)) else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }
        *state = TileState::Cancelled;
        true
    }

    pub fn get(&self, epoch: u64, coord: &TileCoord) -> Option<TileState> {
        [&self.current, &self.previous]
            .into_iter()
            .find(|s| s.epoch == epoch)
            .and_then(|s| s.states.get(coord).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_previous_epoch() {
        let mut tracker = Tracker::default();
        let coord = TileCoord::new(0, 0, 0);

        let (first, _) = tracker.advance();
        assert!(tracker.set(first, coord, TileState::Ready));

        let (second, superseded) = tracker.advance();
        assert_eq!(superseded, 0);
        assert!(tracker.is_current(second));
        assert_eq!(tracker.get(first, &coord), Some(TileState::Ready));
        assert_eq!(tracker.get(second, &coord), None);

        tracker.advance();
        assert!(!tracker.set(first, coord, TileState::Ready));
        assert_eq!(tracker.get(first, &coord), None);
    }

    #[test]
    fn test_advance_cancels_unfinished_tiles() {
        let mut tracker = Tracker::default();
        let (first, _) = tracker.advance();
        tracker.set(first, TileCoord::new(0, 0, 0), TileState::Requested);
        tracker.set(first, TileCoord::new(0, 0, 1), TileState::Building);
        tracker.set(first, TileCoord::new(0, 1, 0), TileState::Failed);

        let (_, superseded) = tracker.advance();
        assert_eq!(superseded, 2);
        assert_eq!(tracker.get(first, &TileCoord::new(0, 0, 0)), Some(TileState::Cancelled));
        assert_eq!(tracker.get(first, &TileCoord::new(0, 0, 1)), Some(TileState::Cancelled));
        assert_eq!(tracker.get(first, &TileCoord::new(0, 1, 0)), Some(TileState::Failed));
    }

    #[test]
    fn test_cancel_leaves_finished_tiles() {
        let mut tracker = Tracker::default();
        let (epoch, _) = tracker.advance();
        let (building, ready) = (TileCoord::new(1, 0, 0), TileCoord::new(1, 0, 1));
        tracker.set(epoch, building, TileState::Building);
        tracker.set(epoch, ready, TileState::Ready);

        assert!(tracker.cancel(epoch, &building));
        assert!(!tracker.cancel(epoch, &building));
        assert!(!tracker.cancel(epoch, &ready));
        assert!(!tracker.cancel(epoch + 1, &ready));
        assert_eq!(tracker.get(epoch, &ready), Some(TileState::Ready));
    }
}
