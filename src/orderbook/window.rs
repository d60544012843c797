//! Bounded replay window of recent diff messages
//!
//! Diffs are kept sorted by `(update_id, type)` so the suffix newer than a
//! snapshot can be located with a binary search. When the window is full the
//! diff with the lowest update id is evicted, since it is the first to become
//! irrelevant once any snapshot lands.

use std::collections::VecDeque;

use crate::message::OrderBookMessage;

/// Default number of diffs retained per trading pair
pub const DEFAULT_REPLAY_WINDOW_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    diffs: VecDeque<OrderBookMessage>,
    capacity: usize,
}

impl ReplayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            diffs: VecDeque::with_capacity(capacity.min(DEFAULT_REPLAY_WINDOW_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Insert a diff at its ordered position, evicting the oldest on overflow.
    ///
    /// Returns the evicted diff, if any. A diff older than everything in a
    /// full window is itself the one evicted.
    pub fn push(&mut self, diff: OrderBookMessage) -> Option<OrderBookMessage> {
        // Insert after equal keys so arrival order is kept among ties
        let position = self.diffs.partition_point(|held| held <= &diff);
        self.diffs.insert(position, diff);

        if self.diffs.len() > self.capacity {
            self.diffs.pop_front()
        } else {
            None
        }
    }

    /// Diffs strictly newer than `update_id`, in ascending order
    pub fn newer_than(&self, update_id: u64) -> impl Iterator<Item = &OrderBookMessage> + '_ {
        let start = self.diffs.partition_point(|held| held.update_id <= update_id);
        self.diffs.range(start..)
    }

    /// Move every held diff into this window
    pub fn extend(&mut self, other: ReplayWindow) {
        for diff in other.diffs {
            self.push(diff);
        }
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.diffs.clear();
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(update_id: u64) -> OrderBookMessage {
        OrderBookMessage::diff("BTC-USDT", update_id, 0.0, vec![], vec![])
    }

    fn ids<'a>(iter: impl Iterator<Item = &'a OrderBookMessage>) -> Vec<u64> {
        iter.map(|m| m.update_id).collect()
    }

    #[test]
    fn test_out_of_order_pushes_are_sorted() {
        let mut window = ReplayWindow::new(10);
        for id in [95, 101, 103, 99, 102] {
            window.push(diff(id));
        }
        assert_eq!(ids(window.newer_than(0)), vec![95, 99, 101, 102, 103]);
    }

    #[test]
    fn test_newer_than_is_strict() {
        let mut window = ReplayWindow::new(10);
        for id in [95, 101, 103, 99, 102, 100] {
            window.push(diff(id));
        }
        assert_eq!(ids(window.newer_than(100)), vec![101, 102, 103]);
        assert_eq!(ids(window.newer_than(103)), Vec::<u64>::new());
    }

    #[test]
    fn test_overflow_evicts_lowest_update_id() {
        let mut window = ReplayWindow::new(3);
        window.push(diff(5));
        window.push(diff(2));
        window.push(diff(9));

        let evicted = window.push(diff(7));
        assert_eq!(evicted.map(|m| m.update_id), Some(2));
        assert_eq!(ids(window.newer_than(0)), vec![5, 7, 9]);

        // Older than everything held: rejected straight away
        let evicted = window.push(diff(1));
        assert_eq!(evicted.map(|m| m.update_id), Some(1));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_extend_merges_in_order() {
        let mut saved = ReplayWindow::new(10);
        saved.push(diff(4));
        saved.push(diff(2));

        let mut window = ReplayWindow::new(10);
        window.push(diff(3));
        window.extend(saved);

        assert_eq!(ids(window.newer_than(0)), vec![2, 3, 4]);
    }
}
