//! Sliding window of pose samples fed to the swing-phase model.

use std::collections::VecDeque;

use super::keypoint::PoseKeypointSet;

/// Bounded FIFO of the most recent pose samples. Oldest is evicted first.
pub struct PoseWindow {
    samples: VecDeque<PoseKeypointSet>,
    capacity: usize,
}

impl PoseWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, pose: PoseKeypointSet) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(pose);
    }

    /// Ready for classification only when exactly full
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Chronological copy of the window, oldest first.
    pub fn snapshot(&self) -> Vec<PoseKeypointSet> {
        self.samples.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(frame_index: u64) -> PoseKeypointSet {
        PoseKeypointSet {
            frame_index,
            ..Default::default()
        }
    }

    #[test]
    fn test_fills_then_reports_full() {
        let mut window = PoseWindow::new(3);
        window.push(pose(0));
        window.push(pose(1));
        assert!(!window.is_full());
        window.push(pose(2));
        assert!(window.is_full());
    }

    #[test]
    fn test_never_exceeds_capacity_and_evicts_oldest() {
        let mut window = PoseWindow::new(3);
        for i in 0..10 {
            window.push(pose(i));
            assert!(window.len() <= 3);
        }
        let order: Vec<u64> = window.snapshot().iter().map(|p| p.frame_index).collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[test]
    fn test_clear() {
        let mut window = PoseWindow::new(2);
        window.push(pose(0));
        window.clear();
        assert!(window.is_empty());
        assert!(!window.is_full());
    }
}
