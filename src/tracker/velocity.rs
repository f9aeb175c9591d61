use std::collections::VecDeque;

use crate::geometry::Point;

/// Exponentially-smoothed velocity over the most recent instantaneous
/// inter-sample velocities (normalized units per second).
///
/// The EMA is recomputed over the retained window on every update, oldest first,
/// so a sample falling out of the window no longer contributes.
pub struct VelocitySmoother {
    alpha: f32,
    capacity: usize,
    instantaneous: VecDeque<Point>,
    smoothed: Point,
}

impl VelocitySmoother {
    pub fn new(capacity: usize, alpha: f32) -> Self {
        let capacity = capacity.max(1);
        Self {
            alpha,
            capacity,
            instantaneous: VecDeque::with_capacity(capacity),
            smoothed: Point::default(),
        }
    }

    /// Add the velocity between two consecutive samples. Non-increasing
    /// timestamps are ignored.
    pub fn push(&mut self, from: Point, from_t: f64, to: Point, to_t: f64) {
        let dt = (to_t - from_t) as f32;
        if dt <= 0.0 {
            return;
        }
        let v = Point::new((to.x - from.x) / dt, (to.y - from.y) / dt);
        if self.instantaneous.len() == self.capacity {
            self.instantaneous.pop_front();
        }
        self.instantaneous.push_back(v);
        self.recompute();
    }

    fn recompute(&mut self) {
        let a = self.alpha;
        let mut iter = self.instantaneous.iter();
        let Some(first) = iter.next() else {
            self.smoothed = Point::default();
            return;
        };
        let mut acc = *first;
        for v in iter {
            acc = Point::new(a * v.x + (1.0 - a) * acc.x, a * v.y + (1.0 - a) * acc.y);
        }
        self.smoothed = acc;
    }

    pub fn velocity(&self) -> Point {
        self.smoothed
    }

    pub fn samples(&self) -> usize {
        self.instantaneous.len()
    }

    pub fn reset(&mut self) {
        self.instantaneous.clear();
        self.smoothed = Point::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_single_sample_is_instantaneous() {
        let mut v = VelocitySmoother::new(5, 0.5);
        v.push(Point::new(0.1, 0.5), 0.0, Point::new(0.2, 0.4), 0.1);
        assert!(approx_eq(v.velocity().x, 1.0));
        assert!(approx_eq(v.velocity().y, -1.0));
    }

    #[test]
    fn test_ema_over_samples() {
        let mut v = VelocitySmoother::new(5, 0.5);
        v.push(Point::new(0.0, 0.0), 0.0, Point::new(0.1, 0.0), 0.1); // 1.0
        v.push(Point::new(0.1, 0.0), 0.1, Point::new(0.4, 0.0), 0.2); // 3.0
        assert!(approx_eq(v.velocity().x, 2.0));
    }

    #[test]
    fn test_window_bounded() {
        let mut v = VelocitySmoother::new(2, 1.0);
        for i in 0..5 {
            let t = i as f64 * 0.1;
            v.push(Point::new(0.0, 0.0), t, Point::new(0.1 * i as f32, 0.0), t + 0.1);
        }
        assert_eq!(v.samples(), 2);
        // alpha 1.0 keeps only the newest
        assert!(approx_eq(v.velocity().x, 4.0));
    }

    #[test]
    fn test_zero_dt_ignored() {
        let mut v = VelocitySmoother::new(5, 0.5);
        v.push(Point::new(0.0, 0.0), 1.0, Point::new(0.5, 0.0), 1.0);
        assert_eq!(v.samples(), 0);
        assert_eq!(v.velocity(), Point::default());
    }

    #[test]
    fn test_reset() {
        let mut v = VelocitySmoother::new(5, 0.5);
        v.push(Point::new(0.0, 0.0), 0.0, Point::new(0.1, 0.0), 0.1);
        v.reset();
        assert_eq!(v.samples(), 0);
        assert_eq!(v.velocity(), Point::default());
    }
}
