//! Sliding-window threshold counter.
//!
//! Keeps the last `depth` per-period counts and their running sum. The sign of
//! the threshold passed to [`WindowCounter::push`] selects the comparison:
//! positive thresholds detect a sum rising to at least the threshold, zero or
//! negative thresholds detect a sum falling to at most `|threshold|`.

use std::{collections::VecDeque, fmt};

#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// Newest count at the front.
    window: VecDeque<i64>,
    depth: usize,
    running: i64,
}

impl WindowCounter {
    /// # Panics
    /// If `depth` is zero.
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "window depth must be non-zero");
        Self {
            window: VecDeque::with_capacity(depth + 1),
            depth,
            running: 0,
        }
    }

    /// Add `count` to the window, evicting the oldest entry if the window is
    /// over depth, and test the running sum against `threshold`.
    pub fn push(&mut self, count: i64, threshold: i64) -> bool {
        self.window.push_front(count);
        self.running += count;
        if self.window.len() > self.depth {
            if let Some(oldest) = self.window.pop_back() {
                self.running -= oldest;
            }
        }
        if threshold > 0 {
            self.running >= threshold
        } else {
            self.running <= -threshold
        }
    }

    /// Clear history so that nothing leaks across a gate transition.
    pub fn reset(&mut self) {
        self.window.clear();
        self.running = 0;
    }

    pub fn running_count(&self) -> i64 {
        self.running
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.depth
    }
}

impl fmt::Display for WindowCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}/{}] (", self.running, self.window.len(), self.depth)?;
        for (i, count) in self.window.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{count}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_unit_push_reaches_threshold_of_four() {
        let mut counter = WindowCounter::new(5);
        assert!(!counter.push(1, 4));
        assert!(!counter.push(1, 4));
        assert!(!counter.push(1, 4));
        assert!(counter.push(1, 4));
        assert!(counter.push(1, 4));
        assert_eq!(counter.running_count(), 5);
        assert!(counter.is_full());

        // Sixth push evicts the first 1: sum stays bounded by depth.
        assert!(counter.push(1, 4));
        assert_eq!(counter.running_count(), 5);
        assert_eq!(counter.len(), 5);
    }

    #[test]
    fn running_sum_tracks_retained_counts() {
        let mut counter = WindowCounter::new(3);
        for count in [5, 0, 2, 7, 1] {
            counter.push(count, 100);
        }
        // Retained: 1, 7, 2
        assert_eq!(counter.running_count(), 10);
        assert_eq!(counter.to_string(), "10 [3/3] (1 7 2)");
    }

    #[test]
    fn negative_threshold_detects_falling_sum() {
        let mut counter = WindowCounter::new(2);
        assert!(!counter.push(6, -4));
        assert!(!counter.push(3, -4));
        // Window now holds 1, 3.
        assert!(counter.push(1, -4));
        assert!(counter.push(0, -4));
    }

    #[test]
    fn reset_clears_history() {
        let mut counter = WindowCounter::new(4);
        counter.push(9, 1);
        counter.push(9, 1);
        counter.reset();
        assert!(counter.is_empty());
        assert_eq!(counter.running_count(), 0);
        assert!(!counter.push(0, 1));
        assert_eq!(counter.to_string(), "0 [1/4] (0)");
    }

    #[test]
    #[should_panic(expected = "window depth must be non-zero")]
    fn zero_depth_is_rejected() {
        let _ = WindowCounter::new(0);
    }
}
